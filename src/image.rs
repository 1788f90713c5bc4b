//! Unpack a `docker save`/OCI image tar export into a typed, queryable
//! structure.
//!
//! [`ExtractedImage`] extracts the export into a scoped temp directory,
//! requires and parses `manifest.json`, reads the image config, and pairs
//! config history entries with layer blobs by walking history newest to
//! oldest (empty layers have no blob), re-reversed to build order.
//!
//! A missing or unparseable manifest/config fails the whole load; that is
//! the fatal boundary for everything downstream.

use crate::notifier::Notifier;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tar_rs as tar;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// ---- Typed export-archive documents ----

#[derive(Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

#[derive(Deserialize)]
struct ConfigDoc {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
    #[serde(default)]
    created: String,
    config: Option<RunConfig>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

#[derive(Deserialize)]
struct RunConfig {
    #[serde(rename = "Env", default)]
    env: Vec<String>,
    #[serde(rename = "Cmd")]
    cmd: Option<Vec<String>>,
    #[serde(rename = "Entrypoint")]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "ExposedPorts")]
    exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(rename = "Volumes")]
    volumes: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(rename = "Labels")]
    labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "WorkingDir")]
    working_dir: Option<String>,
    #[serde(rename = "User")]
    user: Option<String>,
    #[serde(rename = "OnBuild")]
    onbuild: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    created: String,
    #[serde(default)]
    created_by: String,
    comment: Option<String>,
    #[serde(default)]
    empty_layer: bool,
}

#[derive(Deserialize)]
struct IndexDoc {
    #[serde(default)]
    manifests: Vec<IndexManifest>,
}

#[derive(Deserialize)]
struct IndexManifest {
    digest: String,
}

// ---- Public model ----

/// Image identity and runtime configuration, merged-friendly.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageConfigInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub created: String,
    pub architecture: String,
    pub os: String,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub onbuild: Vec<String>,
    pub history: Vec<HistoryRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub created: String,
    pub command: String,
    pub comment: Option<String>,
    pub empty: bool,
}

/// One image layer in build order (oldest first).
#[derive(Debug, Clone)]
pub struct LayerBlob {
    pub id: String,
    pub digest: String,
    pub command: String,
    pub created_at: DateTime<Utc>,
    pub is_empty: bool,
    /// `Some` for layers backed by a filesystem blob.
    pub tarball_path: Option<PathBuf>,
    pub comment: Option<String>,
}

pub struct ExtractedImage {
    extract_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
    config: ImageConfigInfo,
    layers: Vec<LayerBlob>,
}

impl ExtractedImage {
    pub fn from_tarball<P: AsRef<Path>>(tarball_path: P, notifier: &Notifier) -> Result<Self> {
        let tarball_path = tarball_path.as_ref();
        notifier.debug(&format!("extracting image tarball: {}", tarball_path.display()));

        let temp_dir = tempfile::tempdir().context("failed to create temporary directory")?;
        let extract_dir = temp_dir.path().join("extracted");
        fs::create_dir_all(&extract_dir)?;

        extract_export(tarball_path, &extract_dir)
            .with_context(|| format!("failed to extract {}", tarball_path.display()))?;

        let manifest_path = extract_dir.join("manifest.json");
        if !manifest_path.exists() {
            bail!(
                "invalid image tarball: manifest.json not found in {}",
                tarball_path.display()
            );
        }

        notifier.debug("loading image manifest and config");
        let manifest = load_manifest(&manifest_path)?;
        let config_doc = load_config_doc(&extract_dir, &manifest.config)?;

        let mut config = config_info_from_doc(&config_doc);
        config.repo_tags = manifest.repo_tags.clone();
        config.id = read_image_id(&extract_dir, &manifest.config);

        let layers = pair_history_with_blobs(&extract_dir, &config_doc, &manifest)?;
        notifier.info(&format!("loaded {} layers", layers.len()));

        Ok(ExtractedImage {
            extract_dir,
            _temp_dir: temp_dir,
            config,
            layers,
        })
    }

    pub fn config(&self) -> &ImageConfigInfo {
        &self.config
    }

    /// Layers in build order, oldest first.
    pub fn layers(&self) -> &[LayerBlob] {
        &self.layers
    }

    /// Layers backed by a filesystem blob, build order preserved.
    pub fn blob_layers(&self) -> Vec<&LayerBlob> {
        self.layers
            .iter()
            .filter(|l| l.tarball_path.is_some())
            .collect()
    }

    pub fn extract_dir(&self) -> &Path {
        &self.extract_dir
    }
}

fn load_manifest(manifest_path: &Path) -> Result<ManifestEntry> {
    let content = fs::read_to_string(manifest_path).context("failed to read manifest.json")?;
    let mut entries: Vec<ManifestEntry> =
        serde_json::from_str(&content).context("failed to parse manifest.json")?;
    if entries.is_empty() {
        bail!("empty manifest.json");
    }
    Ok(entries.remove(0))
}

fn load_config_doc(extract_dir: &Path, config_file: &str) -> Result<ConfigDoc> {
    let config_path = extract_dir.join(config_file);
    let content = fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read config file: {config_file}"))?;
    serde_json::from_str(&content).context("failed to parse image configuration")
}

fn config_info_from_doc(doc: &ConfigDoc) -> ImageConfigInfo {
    let run = doc.config.as_ref();
    ImageConfigInfo {
        id: String::new(),
        repo_tags: Vec::new(),
        created: doc.created.clone(),
        architecture: doc.architecture.clone(),
        os: doc.os.clone(),
        env: run.map(|r| r.env.clone()).unwrap_or_default(),
        cmd: run.and_then(|r| r.cmd.clone()),
        entrypoint: run.and_then(|r| r.entrypoint.clone()),
        exposed_ports: run
            .and_then(|r| r.exposed_ports.as_ref())
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default(),
        volumes: run
            .and_then(|r| r.volumes.as_ref())
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default(),
        labels: run.and_then(|r| r.labels.clone()).unwrap_or_default(),
        working_dir: run.and_then(|r| r.working_dir.clone()),
        user: run.and_then(|r| r.user.clone()),
        onbuild: run.and_then(|r| r.onbuild.clone()).unwrap_or_default(),
        history: doc
            .history
            .iter()
            .map(|h| HistoryRecord {
                created: h.created.clone(),
                command: strip_shell_prefix(&h.created_by),
                comment: h.comment.clone(),
                empty: h.empty_layer,
            })
            .collect(),
    }
}

/// The image id, preferring the OCI index digest (what `docker image
/// inspect` reports), falling back to the config blob path.
fn read_image_id(extract_dir: &Path, config_file: &str) -> String {
    let index_path = extract_dir.join("index.json");
    if index_path.exists() {
        if let Ok(content) = fs::read_to_string(&index_path) {
            if let Ok(index) = serde_json::from_str::<IndexDoc>(&content) {
                if let Some(first) = index.manifests.first() {
                    return first.digest.clone();
                }
            }
        }
    }
    if let Some(hash) = config_file.strip_prefix("blobs/sha256/") {
        return format!("sha256:{hash}");
    }
    if let Some(hash) = config_file.strip_suffix(".json") {
        return format!("sha256:{hash}");
    }
    String::new()
}

/// Walks history newest to oldest, pairing non-empty entries with manifest
/// layer blobs, then re-reverses to build order. Blobs left unpaired by a
/// short history get anonymous records at the front.
fn pair_history_with_blobs(
    extract_dir: &Path,
    doc: &ConfigDoc,
    manifest: &ManifestEntry,
) -> Result<Vec<LayerBlob>> {
    let blob_paths: Vec<PathBuf> = manifest
        .layers
        .iter()
        .map(|rel| extract_dir.join(rel))
        .collect();

    let mut blob_idx = blob_paths.len();
    let mut layers: Vec<LayerBlob> = Vec::new();

    for (i, entry) in doc.history.iter().enumerate().rev() {
        let created_at = parse_created(&entry.created);
        let command = strip_shell_prefix(&entry.created_by);

        let (id, tarball_path, digest) = if !entry.empty_layer && blob_idx > 0 {
            blob_idx -= 1;
            let blob = &blob_paths[blob_idx];
            let id = blob
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("layer-{i}"));
            (id, Some(blob.clone()), digest_from_blob_path(blob))
        } else {
            let digest = if entry.empty_layer { "empty" } else { "no-tarball" };
            (format!("<empty-layer-{i}>"), None, digest.to_string())
        };

        layers.push(LayerBlob {
            id,
            digest,
            command,
            created_at,
            is_empty: entry.empty_layer,
            tarball_path,
            comment: entry.comment.clone(),
        });
    }

    layers.reverse();

    // History shorter than the blob list (or absent): synthesize records for
    // the unmatched oldest blobs so every blob is reachable.
    if blob_idx > 0 {
        let mut front: Vec<LayerBlob> = blob_paths[..blob_idx]
            .iter()
            .map(|blob| LayerBlob {
                id: blob
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                digest: digest_from_blob_path(blob),
                command: String::new(),
                created_at: DateTime::<Utc>::UNIX_EPOCH,
                is_empty: false,
                tarball_path: Some(blob.clone()),
                comment: None,
            })
            .collect();
        front.extend(layers);
        layers = front;
    }

    Ok(layers)
}

fn parse_created(created: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(created)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Strips the `/bin/sh -c` wrapper docker records in history commands.
pub fn strip_shell_prefix(created_by: &str) -> String {
    if created_by.contains("/bin/sh -c #(nop) ") {
        created_by
            .replace("/bin/sh -c #(nop) ", "")
            .trim_start()
            .to_string()
    } else if created_by.contains("/bin/sh -c ") {
        created_by
            .replace("/bin/sh -c ", "")
            .trim_start()
            .to_string()
    } else {
        created_by.to_string()
    }
}

/// Derives a `sha256:` digest string from a layer blob path.
pub fn digest_from_blob_path(path: &Path) -> String {
    if let Some(parent) = path.parent() {
        if parent.file_name().and_then(|s| s.to_str()) == Some("sha256") {
            if let Some(digest) = path.file_name().and_then(|s| s.to_str()) {
                return format!("sha256:{digest}");
            }
        }
    }
    match path.file_name().and_then(|s| s.to_str()) {
        Some(name) if name.starts_with("sha256:") => name.to_string(),
        Some(name) => format!("sha256:{name}"),
        None => "unknown".to_string(),
    }
}

/// Extracts an export tar (plain or gzipped, by magic bytes) into a directory.
fn extract_export(tar_path: &Path, dest: &Path) -> Result<()> {
    let mut file =
        File::open(tar_path).with_context(|| format!("failed to open {}", tar_path.display()))?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    drop(file);

    let file = File::open(tar_path)?;
    let reader: Box<dyn Read> = if n == 2 && magic == GZIP_MAGIC {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut archive = tar::Archive::new(reader);
    archive
        .unpack(dest)
        .map_err(|e| anyhow!("failed to unpack image export: {e}"))
}
