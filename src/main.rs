use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{debug, info, LevelFilter};
use std::path::PathBuf;

use layerlens::matchers::{
    ChangeDataHashMatcher, ChangeDataMatcher, ChangePathMatcher, DumpSink, MatcherSet,
};
use layerlens::merge::MergeOptions;
use layerlens::package::XrayOptions;
use layerlens::{report, DockerSource, Notifier, Source, TarSource};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum SourceKind {
    Docker,
    Tar,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Disables progress bars"
    )]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect an image's layers, changes and contents
    Xray {
        #[arg(help = "Image to inspect (name for docker source, path for tar source)")]
        image: String,

        #[arg(short, long, value_enum, default_value = "docker", help = "Where the image comes from")]
        source: SourceKind,

        #[arg(long, default_value_t = 20, help = "Largest objects tracked per layer (0 disables)")]
        top: usize,

        #[arg(long, help = "Hash file content while scanning")]
        hash_data: bool,

        #[arg(long, help = "Detect duplicate files by content hash (implies --hash-data)")]
        detect_duplicates: bool,

        #[arg(long, help = "Classify live files as UTF-8 text")]
        detect_utf8: bool,

        #[arg(long, help = "Record unchanged entries under their layer")]
        changes_all: bool,

        #[arg(
            long = "path-matcher",
            value_name = "REGEX[:dump[:DIR]]",
            help = "Report only changes whose path matches; optionally dump content"
        )]
        path_matchers: Vec<String>,

        #[arg(
            long = "data-matcher",
            value_name = "[PATH_RE::]DATA_RE",
            help = "Report only changes whose content matches"
        )]
        data_matchers: Vec<String>,

        #[arg(
            long = "hash-matcher",
            value_name = "HEX",
            help = "Report only changes with this content hash"
        )]
        hash_matchers: Vec<String>,

        #[arg(short, long, help = "Write a JSON report to this path")]
        report: Option<PathBuf>,
    },

    /// Merge two images' filesystems into one synthesized layer
    Merge {
        #[arg(help = "First (base) image")]
        first: String,

        #[arg(help = "Last (override) image")]
        last: String,

        #[arg(short, long, value_enum, default_value = "docker", help = "Where the images come from")]
        source: SourceKind,

        #[arg(short, long, help = "Path for the synthesized tar layer")]
        output: Option<PathBuf>,

        #[arg(long, help = "Take the last image's config wholesale instead of merging")]
        use_last_image_metadata: bool,

        #[arg(short, long, help = "Tag for the merged image (repeatable)")]
        tag: Vec<String>,

        #[arg(short, long, help = "Write a JSON report to this path")]
        report: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_env(Env::default())
        .filter_level(log_level)
        .init();

    let notifier = Notifier::new(cli.verbose);

    match cli.command {
        Command::Xray {
            image,
            source,
            top,
            hash_data,
            detect_duplicates,
            detect_utf8,
            changes_all,
            path_matchers,
            data_matchers,
            hash_matchers,
            report,
        } => {
            info!("starting xray of {image}");
            let matchers = build_matcher_set(&path_matchers, &data_matchers, &hash_matchers)?;
            let options = XrayOptions {
                top_changes_max: top,
                hash_data,
                detect_duplicates,
                detect_utf8,
                record_unchanged: changes_all,
                matchers,
            };

            let (tarball, _keep_alive) = resolve_source(source)?.get_image_tarball(&image)?;
            debug!("image tarball at {}", tarball.display());

            let package = layerlens::load_package(&tarball, &options, &notifier)?;
            print_xray_summary(&package);

            if let Some(path) = report {
                report::save_report("xray", &package, &path)?;
                println!("report: {}", path.display());
            }
        }
        Command::Merge {
            first,
            last,
            source,
            output,
            use_last_image_metadata,
            tag,
            report,
        } => {
            info!("starting merge of {first} + {last}");
            let src = resolve_source(source)?;
            let (first_tar, _keep_first) = src.get_image_tarball(&first)?;
            let (last_tar, _keep_last) = src.get_image_tarball(&last)?;

            let options = MergeOptions {
                output,
                use_last_image_metadata,
                tags: tag,
            };
            let outcome = layerlens::merge_images(&first_tar, &last_tar, &options, &notifier)?;

            println!("merged layer: {}", outcome.tar_path.display());
            println!("entries: {}", outcome.entry_count);
            println!("duplicates: {}", outcome.dup_count);
            println!("replaced: {}", outcome.replaced_count);
            if !outcome.tags.is_empty() {
                println!("tags: {}", outcome.tags.join(", "));
            }

            if let Some(path) = report {
                report::save_report("merge", &outcome, &path)?;
                println!("report: {}", path.display());
            }
        }
    }

    Ok(())
}

fn resolve_source(kind: SourceKind) -> Result<Box<dyn Source>> {
    match kind {
        SourceKind::Docker => Ok(Box::new(DockerSource::new()?)),
        SourceKind::Tar => Ok(Box::new(TarSource::new()?)),
    }
}

/// Parses CLI matcher strings into the typed matcher set the engine takes.
fn build_matcher_set(
    path_specs: &[String],
    data_specs: &[String],
    hash_specs: &[String],
) -> Result<MatcherSet> {
    let mut set = MatcherSet::default();

    for spec in path_specs {
        set.path.push(parse_path_matcher(spec)?);
    }
    for spec in data_specs {
        let matcher = match spec.split_once("::") {
            Some((path_re, data_re)) if !path_re.is_empty() => {
                ChangeDataMatcher::new(Some(path_re), data_re)?
            }
            Some((_, data_re)) => ChangeDataMatcher::new(None, data_re)?,
            None => ChangeDataMatcher::new(None, spec)?,
        };
        set.data.push(matcher);
    }
    for spec in hash_specs {
        set.hash.push(ChangeDataHashMatcher::parse(spec)?);
    }

    Ok(set)
}

/// `REGEX`, `REGEX:dump` (console) or `REGEX:dump:DIR`.
fn parse_path_matcher(spec: &str) -> Result<ChangePathMatcher> {
    match spec.find(":dump") {
        Some(idx) => {
            let pattern = &spec[..idx];
            let rest = &spec[idx + ":dump".len()..];
            let matcher = ChangePathMatcher::new(pattern)?;
            if rest.is_empty() {
                Ok(matcher.with_dump(DumpSink::Console))
            } else if let Some(dir) = rest.strip_prefix(':') {
                Ok(matcher.with_dump(DumpSink::Dir(PathBuf::from(dir))))
            } else {
                Err(anyhow!("malformed path matcher spec: {spec}"))
            }
        }
        None => ChangePathMatcher::new(spec),
    }
}

fn print_xray_summary(package: &layerlens::Package) {
    println!("image: {}", package.image.id);
    if !package.image.repo_tags.is_empty() {
        println!("tags: {}", package.image.repo_tags.join(", "));
    }
    println!(
        "platform: {}/{}",
        package.image.os, package.image.architecture
    );
    if let Some(distro) = &package.distro {
        println!("distro: {}", distro.name);
    }
    println!("layers: {}", package.stats.layer_count);

    for layer in &package.layers {
        println!();
        println!("layer {}: {}", layer.index, layer.digest);
        if !layer.command.is_empty() {
            println!("  command: {}", layer.command);
        }
        println!(
            "  changes: {} added, {} modified, {} deleted",
            layer.added.len(),
            layer.modified.len(),
            layer.deleted.len()
        );
        for &i in layer.added.iter().chain(&layer.modified) {
            let obj = &layer.objects[i];
            if obj.path_match {
                println!("  match: /{}", obj.name);
            }
        }
        for (path, patterns) in &layer.data_matches {
            println!("  data match: /{path} ({})", patterns.join(", "));
        }
        for path in &layer.hash_matches {
            println!("  hash match: /{path}");
        }
        if !layer.top.is_empty() {
            println!("  top objects:");
            for t in &layer.top {
                println!("    {:>12}  /{}", t.size, t.name);
            }
        }
    }

    if !package.duplicates.is_empty() {
        println!();
        println!(
            "duplicates: {} groups, {} bytes wasted",
            package.stats.duplicate_group_count, package.stats.duplicate_wasted
        );
    }
    if !package.os_shells.is_empty() {
        println!("shells: {}", package.os_shells.join(", "));
    }
    if !package.special_perms.is_empty() {
        println!(
            "special perms: {} setuid, {} setgid, {} sticky",
            package.special_perms.setuid.len(),
            package.special_perms.setgid.len(),
            package.special_perms.sticky.len()
        );
    }
    for (detector, error) in &package.detector_errors {
        println!("detector {detector} failed: {error}");
    }
}
