//! Shared fixture builders: miniature layer tars and image exports built
//! in memory, so the tests run without Docker or network access.

#![allow(dead_code)]

use serde_json::json;
use std::io::Write as _;
use tar_rs as tar;

/// One entry of a fixture layer.
pub enum Entry<'a> {
    File {
        name: &'a str,
        data: &'a [u8],
        mode: u32,
    },
    Dir(&'a str),
    Symlink {
        name: &'a str,
        target: &'a str,
    },
}

impl<'a> Entry<'a> {
    pub fn file(name: &'a str, data: &'a [u8]) -> Self {
        Entry::File {
            name,
            data,
            mode: 0o644,
        }
    }
}

/// Builds a layer tar in memory.
pub fn layer_tar(entries: &[Entry]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        match entry {
            Entry::File { name, data, mode } => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(data.len() as u64);
                header.set_mode(*mode);
                header.set_mtime(1_700_000_000);
                builder.append_data(&mut header, name, *data).unwrap();
            }
            Entry::Dir(name) => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_mtime(1_700_000_000);
                builder
                    .append_data(&mut header, *name, std::io::empty())
                    .unwrap();
            }
            Entry::Symlink { name, target } => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                header.set_mtime(1_700_000_000);
                builder.append_link(&mut header, *name, *target).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

/// Wraps layer tars into a `docker save` style export with the given run
/// config section.
pub fn image_export_with_config(
    layers: &[Vec<u8>],
    run_config: serde_json::Value,
) -> tempfile::NamedTempFile {
    let mut builder = tar::Builder::new(Vec::new());
    let mut layer_paths = Vec::new();

    for (i, bytes) in layers.iter().enumerate() {
        let path = format!("layer{i}/layer.tar");
        append_file(&mut builder, &path, bytes);
        layer_paths.push(path);
    }

    let history: Vec<serde_json::Value> = (0..layers.len())
        .map(|i| {
            json!({
                "created": "2024-01-01T00:00:00Z",
                "created_by": format!("/bin/sh -c layer-step-{i}"),
                "empty_layer": false,
            })
        })
        .collect();

    let config = json!({
        "architecture": "amd64",
        "os": "linux",
        "created": "2024-01-01T00:00:00Z",
        "config": run_config,
        "history": history,
        "rootfs": { "type": "layers", "diff_ids": [] },
    });
    append_file(&mut builder, "config.json", config.to_string().as_bytes());

    let manifest = json!([{
        "Config": "config.json",
        "RepoTags": ["fixture:latest"],
        "Layers": layer_paths,
    }]);
    append_file(&mut builder, "manifest.json", manifest.to_string().as_bytes());

    let bytes = builder.into_inner().unwrap();
    let mut file = tempfile::NamedTempFile::with_suffix(".tar").unwrap();
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();
    file
}

pub fn image_export(layers: &[Vec<u8>]) -> tempfile::NamedTempFile {
    image_export_with_config(layers, json!({ "Env": ["PATH=/usr/local/bin:/usr/bin"] }))
}

/// Writes a standalone layer tar to disk, for tests that index layers
/// directly.
pub fn layer_file(entries: &[Entry]) -> tempfile::NamedTempFile {
    let bytes = layer_tar(entries);
    let mut file = tempfile::NamedTempFile::with_suffix(".tar").unwrap();
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();
    file
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(1_700_000_000);
    builder.append_data(&mut header, name, data).unwrap();
}
