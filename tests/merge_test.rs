mod common;

use common::{image_export_with_config, layer_file, layer_tar, Entry};
use layerlens::merge::{flatten, merge_trees, ImageIndex, MergeOptions, Origin};
use layerlens::{merge_images, Notifier, TarIndex};
use serde_json::json;

fn quiet() -> Notifier {
    Notifier::new(1)
}

fn single_layer_index(entries: &[Entry]) -> (tempfile::NamedTempFile, ImageIndex) {
    let file = layer_file(entries);
    let index = TarIndex::open(file.path()).unwrap();
    (file, ImageIndex { layers: vec![index] })
}

#[test]
fn merging_an_image_with_itself_is_idempotent() {
    let entries = [
        Entry::Dir("app"),
        Entry::file("app/server", b"binary"),
        Entry::file("app/config.yaml", b"port: 8080"),
    ];
    let (_f1, first) = single_layer_index(&entries);
    let (_f2, last) = single_layer_index(&entries);

    let base_tree = flatten(&first);
    let base_paths: Vec<&String> = base_tree.keys().collect();
    let merged = merge_trees(base_tree.clone(), flatten(&last));

    // Same path set, every entry folded as a duplicate, nothing replaced.
    let merged_paths: Vec<&String> = merged.entries.keys().collect();
    assert_eq!(merged_paths, base_paths);
    for entry in merged.entries.values() {
        assert_eq!(entry.dups, 1);
        assert!(entry.replaced.is_empty());
        assert_eq!(entry.origin, Origin::Base);
    }
}

#[test]
fn merge_round_trip_prefers_override_content() {
    let (_f1, first) = single_layer_index(&[
        Entry::file("a", b"base a"),
        Entry::file("b", b"base b"),
    ]);
    let (_f2, last) = single_layer_index(&[
        Entry::file("b", b"override b, different"),
        Entry::file("c", b"override c"),
    ]);

    let merged = merge_trees(flatten(&first), flatten(&last));

    let paths: Vec<&str> = merged.entries.keys().map(|s| s.as_str()).collect();
    assert_eq!(paths, vec!["a", "b", "c"]);

    let b = &merged.entries["b"];
    assert_eq!(b.origin, Origin::Override);
    assert_eq!(b.replaced.len(), 1);
    assert_eq!(b.replaced[0].size, b"base b".len() as u64);
    assert_eq!(b.dups, 0);

    assert_eq!(merged.entries["a"].origin, Origin::Base);
    assert_eq!(merged.entries["c"].origin, Origin::Override);
}

#[test]
fn flatten_honors_whiteouts_across_layers() {
    let l0 = layer_file(&[
        Entry::file("keep", b"keep"),
        Entry::file("gone", b"gone"),
        Entry::file("cache/a", b"a"),
    ]);
    let l1 = layer_file(&[
        Entry::file(".wh.gone", b""),
        Entry::file("cache/.wh..wh..opq", b""),
    ]);
    let index = ImageIndex {
        layers: vec![
            TarIndex::open(l0.path()).unwrap(),
            TarIndex::open(l1.path()).unwrap(),
        ],
    };

    let tree = flatten(&index);
    let paths: Vec<&str> = tree.keys().map(|s| s.as_str()).collect();
    assert_eq!(paths, vec!["keep"]);
}

#[test]
fn merge_images_writes_sorted_deduplicated_tar() {
    let base_layer = layer_tar(&[
        Entry::Dir("etc"),
        Entry::file("etc/base.conf", b"base"),
        Entry::file("shared.txt", b"same bytes"),
    ]);
    let over_layer = layer_tar(&[
        Entry::file("shared.txt", b"same bytes"),
        Entry::file("etc/over.conf", b"override"),
        Entry::file("zz-last.txt", b"tail"),
    ]);
    let base_export = image_export_with_config(&[base_layer], json!({}));
    let over_export = image_export_with_config(&[over_layer], json!({}));

    let out_dir = tempfile::tempdir().unwrap();
    let options = MergeOptions {
        output: Some(out_dir.path().join("merged.tar")),
        ..Default::default()
    };
    let outcome =
        merge_images(base_export.path(), over_export.path(), &options, &quiet()).unwrap();

    assert_eq!(outcome.entry_count, 5);
    assert_eq!(outcome.dup_count, 1);
    assert_eq!(outcome.replaced_count, 0);

    // The synthesized tar is readable, sorted by path, and carries the
    // merged contents.
    let merged_index = TarIndex::open(&outcome.tar_path).unwrap();
    let names: Vec<&str> = merged_index.iter_order().map(|m| m.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "etc",
            "etc/base.conf",
            "etc/over.conf",
            "shared.txt",
            "zz-last.txt"
        ]
    );

    let shared = merged_index.get("shared.txt").unwrap();
    assert_eq!(merged_index.read_entry(shared).unwrap(), b"same bytes");
    let over = merged_index.get("etc/over.conf").unwrap();
    assert_eq!(merged_index.read_entry(over).unwrap(), b"override");
}

#[test]
fn merge_images_override_content_wins_in_output() {
    let base_layer = layer_tar(&[Entry::file("app/config", b"base config")]);
    let over_layer = layer_tar(&[Entry::file("app/config", b"override config, longer")]);
    let base_export = image_export_with_config(&[base_layer], json!({}));
    let over_export = image_export_with_config(&[over_layer], json!({}));

    let out_dir = tempfile::tempdir().unwrap();
    let options = MergeOptions {
        output: Some(out_dir.path().join("merged.tar")),
        ..Default::default()
    };
    let outcome =
        merge_images(base_export.path(), over_export.path(), &options, &quiet()).unwrap();

    assert_eq!(outcome.replaced_count, 1);
    let merged_index = TarIndex::open(&outcome.tar_path).unwrap();
    let config = merged_index.get("app/config").unwrap();
    assert_eq!(
        merged_index.read_entry(config).unwrap(),
        b"override config, longer"
    );
}

#[test]
fn zero_byte_and_symlink_entries_survive_merge() {
    let base_layer = layer_tar(&[
        Entry::file("empty.marker", b""),
        Entry::Symlink {
            name: "bin/sh",
            target: "busybox",
        },
    ]);
    let over_layer = layer_tar(&[Entry::file("other", b"x")]);
    let base_export = image_export_with_config(&[base_layer], json!({}));
    let over_export = image_export_with_config(&[over_layer], json!({}));

    let out_dir = tempfile::tempdir().unwrap();
    let options = MergeOptions {
        output: Some(out_dir.path().join("merged.tar")),
        ..Default::default()
    };
    let outcome =
        merge_images(base_export.path(), over_export.path(), &options, &quiet()).unwrap();

    let merged_index = TarIndex::open(&outcome.tar_path).unwrap();
    let empty = merged_index.get("empty.marker").unwrap();
    assert_eq!(empty.size, 0);
    assert_eq!(empty.hash, None);
    let link = merged_index.get("bin/sh").unwrap();
    assert!(link.is_symlink());
    assert_eq!(link.link_target.as_deref(), Some("busybox"));
}

#[test]
fn merge_configs_follow_per_field_rules() {
    let base_layer = layer_tar(&[Entry::file("base", b"b")]);
    let over_layer = layer_tar(&[Entry::file("over", b"o")]);
    let base_export = image_export_with_config(
        &[base_layer],
        json!({
            "Env": ["PATH=/bin", "BASE_ONLY=1"],
            "OnBuild": ["RUN x"],
            "Labels": {"team": "base", "keep": "yes"},
            "ExposedPorts": {"80/tcp": {}},
        }),
    );
    let over_export = image_export_with_config(
        &[over_layer],
        json!({
            "Env": ["PATH=/bin", "OVER_ONLY=1"],
            "OnBuild": ["RUN y"],
            "Labels": {"team": "override"},
            "ExposedPorts": {"443/tcp": {}},
        }),
    );

    let out_dir = tempfile::tempdir().unwrap();
    let options = MergeOptions {
        output: Some(out_dir.path().join("merged.tar")),
        tags: vec!["merged:latest".to_string()],
        ..Default::default()
    };
    let outcome =
        merge_images(base_export.path(), over_export.path(), &options, &quiet()).unwrap();

    let config = &outcome.config;
    assert_eq!(config.env, vec!["PATH=/bin", "BASE_ONLY=1", "OVER_ONLY=1"]);
    assert_eq!(config.onbuild, vec!["RUN x", "RUN y"]);
    assert_eq!(config.labels["team"], "override");
    assert_eq!(config.labels["keep"], "yes");
    assert!(config.exposed_ports.contains("80/tcp"));
    assert!(config.exposed_ports.contains("443/tcp"));
    assert_eq!(outcome.tags, vec!["merged:latest"]);
}

#[test]
fn identical_onbuild_chains_are_not_duplicated() {
    let base_layer = layer_tar(&[Entry::file("a", b"a")]);
    let over_layer = layer_tar(&[Entry::file("b", b"b")]);
    let base_export =
        image_export_with_config(&[base_layer], json!({ "OnBuild": ["RUN inherited"] }));
    let over_export =
        image_export_with_config(&[over_layer], json!({ "OnBuild": ["RUN inherited"] }));

    let out_dir = tempfile::tempdir().unwrap();
    let options = MergeOptions {
        output: Some(out_dir.path().join("merged.tar")),
        ..Default::default()
    };
    let outcome =
        merge_images(base_export.path(), over_export.path(), &options, &quiet()).unwrap();
    assert_eq!(outcome.config.onbuild, vec!["RUN inherited"]);
}

#[test]
fn merge_report_serializes() {
    let base_layer = layer_tar(&[Entry::file("a", b"a")]);
    let over_layer = layer_tar(&[Entry::file("b", b"b")]);
    let base_export = image_export_with_config(&[base_layer], json!({}));
    let over_export = image_export_with_config(&[over_layer], json!({}));

    let out_dir = tempfile::tempdir().unwrap();
    let options = MergeOptions {
        output: Some(out_dir.path().join("merged.tar")),
        ..Default::default()
    };
    let outcome =
        merge_images(base_export.path(), over_export.path(), &options, &quiet()).unwrap();

    let report_path = out_dir.path().join("merge.json");
    layerlens::report::save_report("merge", &outcome, &report_path).unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(parsed["kind"], "merge");
    assert_eq!(parsed["data"]["entry_count"], 2);
}
