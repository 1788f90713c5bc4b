//! Layer Synthesizer: merge two images' filesystems into one tar layer.
//!
//! Each image is flattened by replaying its layers (honoring whiteouts) into
//! a single path -> entry tree. The two trees merge under a deterministic
//! conflict rule: the first (base) image's tree is the baseline; override
//! entries that are byte-identical bump a duplicate counter, differing
//! entries replace the baseline and keep the replaced entry as lineage.
//!
//! The synthesized tar is written sorted by path, copying each entry's byte
//! range from its original layer file through a bounded section read.

use crate::image::{ExtractedImage, ImageConfigInfo};
use crate::layer_diff::{whiteout_target, Whiteout};
use crate::notifier::Notifier;
use crate::tar_index::{DataRange, TarIndex};
use anyhow::{Context, Result};
use log::debug;
use serde::Serialize;
use std::collections::{btree_map, BTreeMap, BTreeSet, HashSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tar_rs as tar;

/// All layer indexes of one image, in build order.
///
/// Owns the open layer files; flattened entries reference them by layer
/// index, so byte ranges resolve through this arena rather than through
/// shared file handles.
pub struct ImageIndex {
    pub layers: Vec<TarIndex>,
}

impl ImageIndex {
    pub fn from_image(image: &ExtractedImage) -> Result<Self> {
        let mut layers = Vec::new();
        for blob in image.blob_layers() {
            let Some(path) = &blob.tarball_path else {
                continue;
            };
            let index = TarIndex::open(path)
                .with_context(|| format!("failed to index layer {}", blob.digest))?;
            layers.push(index);
        }
        Ok(ImageIndex { layers })
    }
}

/// One path of a flattened image tree.
#[derive(Debug, Clone)]
pub struct FlatEntry {
    pub name: String,
    pub entry_type: u8,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub link_target: Option<String>,
    pub hash: Option<u64>,
    /// Which layer of the owning image holds the content.
    pub layer: usize,
    pub data: Option<DataRange>,
}

impl FlatEntry {
    fn same_content(&self, other: &FlatEntry) -> bool {
        self.entry_type == other.entry_type
            && self.size == other.size
            && self.hash == other.hash
    }
}

pub type FlatTree = BTreeMap<String, FlatEntry>;

/// Replays an image's layers into a single tree, honoring whiteouts.
pub fn flatten(index: &ImageIndex) -> FlatTree {
    let mut tree: FlatTree = BTreeMap::new();

    for (layer_idx, layer) in index.layers.iter().enumerate() {
        for meta in layer.iter_order() {
            match whiteout_target(&meta.name) {
                Some(Whiteout::Path(target)) => {
                    tree.remove(&target);
                    let prefix = format!("{target}/");
                    tree.retain(|k, _| !k.starts_with(&prefix));
                }
                Some(Whiteout::Opaque(dir)) => {
                    let prefix = if dir.is_empty() {
                        String::new()
                    } else {
                        format!("{dir}/")
                    };
                    tree.retain(|k, _| !(k.starts_with(&prefix) && k != &dir));
                }
                None => {
                    tree.insert(
                        meta.name.clone(),
                        FlatEntry {
                            name: meta.name.clone(),
                            entry_type: meta.entry_type,
                            size: meta.size,
                            mode: meta.mode,
                            uid: meta.uid,
                            gid: meta.gid,
                            mtime: meta.mtime,
                            link_target: meta.link_target.clone(),
                            hash: meta.hash,
                            layer: layer_idx,
                            data: meta.data,
                        },
                    );
                }
            }
        }
    }

    tree
}

/// Which image a merged entry's content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Base,
    Override,
}

#[derive(Debug)]
pub struct MergedEntry {
    pub entry: FlatEntry,
    pub origin: Origin,
    /// Byte-identical collisions folded into this entry.
    pub dups: u32,
    /// Baseline entries displaced by the override image, oldest first.
    pub replaced: Vec<FlatEntry>,
}

pub struct MergedTree {
    pub entries: BTreeMap<String, MergedEntry>,
}

impl MergedTree {
    pub fn dup_count(&self) -> u64 {
        self.entries.values().map(|e| e.dups as u64).sum()
    }

    pub fn replaced_count(&self) -> usize {
        self.entries.values().map(|e| e.replaced.len()).sum()
    }
}

/// Merges the override tree onto the base tree under the conflict rule.
pub fn merge_trees(base: FlatTree, overlay: FlatTree) -> MergedTree {
    let mut entries: BTreeMap<String, MergedEntry> = base
        .into_iter()
        .map(|(name, entry)| {
            (
                name,
                MergedEntry {
                    entry,
                    origin: Origin::Base,
                    dups: 0,
                    replaced: Vec::new(),
                },
            )
        })
        .collect();

    for (name, over_entry) in overlay {
        match entries.entry(name) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(MergedEntry {
                    entry: over_entry,
                    origin: Origin::Override,
                    dups: 0,
                    replaced: Vec::new(),
                });
            }
            btree_map::Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if existing.entry.same_content(&over_entry) {
                    // Byte-identical: content wins arbitrarily, the baseline
                    // entry's source stays in place.
                    existing.dups += 1;
                } else {
                    debug!("merge conflict on {}, override wins", over_entry.name);
                    let displaced = std::mem::replace(&mut existing.entry, over_entry);
                    existing.origin = Origin::Override;
                    existing.replaced.push(displaced);
                }
            }
        }
    }

    MergedTree { entries }
}

/// Writes the merged tree as a fresh tar, sorted by path for reproducible
/// output. Entries without a data range are header-only.
pub fn write_merged_tar(
    tree: &MergedTree,
    base: &ImageIndex,
    overlay: &ImageIndex,
    out_path: &Path,
) -> Result<()> {
    let file = File::create(out_path)
        .with_context(|| format!("failed to create output tar: {}", out_path.display()))?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    for merged in tree.entries.values() {
        let entry = &merged.entry;
        let source = match merged.origin {
            Origin::Base => base,
            Origin::Override => overlay,
        };

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::new(entry.entry_type));
        header.set_mode(entry.mode);
        header.set_uid(entry.uid);
        header.set_gid(entry.gid);
        header.set_mtime(entry.mtime);

        if let Some(target) = &entry.link_target {
            header.set_size(0);
            builder
                .append_link(&mut header, &entry.name, target)
                .with_context(|| format!("failed to append link {}", entry.name))?;
            continue;
        }

        match entry.data {
            Some(range) => {
                header.set_size(range.size);
                let layer = &source.layers[entry.layer];
                match layer.get(&entry.name) {
                    Some(meta) => {
                        let reader = layer.entry_reader(meta)?;
                        builder
                            .append_data(&mut header, &entry.name, reader)
                            .with_context(|| format!("failed to append {}", entry.name))?;
                    }
                    None => {
                        debug!("no source entry for {}, writing header only", entry.name);
                        header.set_size(0);
                        builder.append_data(&mut header, &entry.name, std::io::empty())?;
                    }
                }
            }
            None => {
                header.set_size(0);
                builder
                    .append_data(&mut header, &entry.name, std::io::empty())
                    .with_context(|| format!("failed to append {}", entry.name))?;
            }
        }
    }

    let inner = builder.into_inner().context("failed to finish tar")?;
    inner
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush output tar: {}", e.error()))?;
    Ok(())
}

/// Options for one merge run.
#[derive(Debug, Default)]
pub struct MergeOptions {
    /// Path of the synthesized tar; a scratch path when unset.
    pub output: Option<PathBuf>,
    /// Take the override image's config wholesale instead of merging.
    pub use_last_image_metadata: bool,
    pub tags: Vec<String>,
}

/// What the merge hands to the image-builder collaborator.
#[derive(Debug, Serialize)]
pub struct MergeOutcome {
    pub tar_path: PathBuf,
    pub config: ImageConfigInfo,
    pub tags: Vec<String>,
    pub entry_count: usize,
    pub dup_count: u64,
    pub replaced_count: usize,
}

/// Merges two exported images into a synthesized layer + merged config.
pub fn merge_images(
    first_tarball: &Path,
    last_tarball: &Path,
    options: &MergeOptions,
    notifier: &Notifier,
) -> Result<MergeOutcome> {
    notifier.info("loading first (base) image");
    let first = ExtractedImage::from_tarball(first_tarball, notifier)?;
    notifier.info("loading last (override) image");
    let last = ExtractedImage::from_tarball(last_tarball, notifier)?;

    notifier.info("indexing image layers");
    let first_index = ImageIndex::from_image(&first)?;
    let last_index = ImageIndex::from_image(&last)?;

    notifier.info("merging filesystem trees");
    let base_tree = flatten(&first_index);
    let over_tree = flatten(&last_index);
    let merged = merge_trees(base_tree, over_tree);

    let tar_path = match &options.output {
        Some(path) => path.clone(),
        None => std::env::temp_dir().join("layerlens-merged-layer.tar"),
    };

    notifier.info(&format!(
        "writing merged layer ({} entries)",
        merged.entries.len()
    ));
    write_merged_tar(&merged, &first_index, &last_index, &tar_path)?;

    let config = merge_configs(
        first.config(),
        last.config(),
        options.use_last_image_metadata,
    );

    notifier.finish();

    Ok(MergeOutcome {
        tar_path,
        config,
        tags: options.tags.clone(),
        entry_count: merged.entries.len(),
        dup_count: merged.dup_count(),
        replaced_count: merged.replaced_count(),
    })
}

/// Merges two image configs field by field.
///
/// Env vars union as whole `KEY=VALUE` strings (base order, then new
/// override values); labels union with the override winning on key
/// collision; ports and volumes set-union; OnBuild concatenates base +
/// override only when the two lists differ.
pub fn merge_configs(
    base: &ImageConfigInfo,
    overlay: &ImageConfigInfo,
    use_last_metadata: bool,
) -> ImageConfigInfo {
    if use_last_metadata {
        return overlay.clone();
    }

    let mut env = base.env.clone();
    let mut seen: HashSet<&str> = base.env.iter().map(|s| s.as_str()).collect();
    for var in &overlay.env {
        if seen.insert(var) {
            env.push(var.clone());
        }
    }

    let mut labels = base.labels.clone();
    for (k, v) in &overlay.labels {
        labels.insert(k.clone(), v.clone());
    }

    let exposed_ports: BTreeSet<String> = base
        .exposed_ports
        .union(&overlay.exposed_ports)
        .cloned()
        .collect();
    let volumes: BTreeSet<String> = base.volumes.union(&overlay.volumes).cloned().collect();

    let onbuild = if base.onbuild == overlay.onbuild {
        overlay.onbuild.clone()
    } else {
        let mut combined = base.onbuild.clone();
        combined.extend(overlay.onbuild.iter().cloned());
        combined
    };

    ImageConfigInfo {
        id: overlay.id.clone(),
        repo_tags: overlay.repo_tags.clone(),
        created: overlay.created.clone(),
        architecture: overlay.architecture.clone(),
        os: overlay.os.clone(),
        env,
        cmd: overlay.cmd.clone().or_else(|| base.cmd.clone()),
        entrypoint: overlay.entrypoint.clone().or_else(|| base.entrypoint.clone()),
        exposed_ports,
        volumes,
        labels,
        working_dir: overlay
            .working_dir
            .clone()
            .or_else(|| base.working_dir.clone()),
        user: overlay.user.clone().or_else(|| base.user.clone()),
        onbuild,
        history: overlay.history.clone(),
    }
}
