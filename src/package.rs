//! Package Loader: turns one image tar export into a fully analyzed
//! [`Package`] — per-layer change reports, cross-layer statistics, matcher
//! results and detector findings.
//!
//! Orchestration order matters: manifest/config first (fatal on failure),
//! then one [`TarIndex`] per layer blob, then the layer differ over the
//! ordered indexes, with stats and matchers applied as changes are
//! classified. Detector sub-passes run last and fail independently.
//!
//! Layer files stay open for the whole load so matchers and detectors can
//! resolve byte ranges lazily; they close when the indexes drop on return.

use crate::detectors::{self, CertsInfo, DistroInfo};
use crate::image::{ExtractedImage, ImageConfigInfo};
use crate::layer_diff::diff_layers;
use crate::matchers::MatcherSet;
use crate::notifier::Notifier;
use crate::objects::ObjectMetadata;
use crate::stats::{
    DuplicateGroup, HashReferences, LayerStats, SpecialPermRefs, TopObject, TopObjects,
};
use crate::tar_index::TarIndex;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Knobs for one `xray` inspection run.
#[derive(Debug, Default)]
pub struct XrayOptions {
    /// Largest-N objects tracked per layer; 0 disables tracking.
    pub top_changes_max: usize,
    /// Populate the global content-hash index.
    pub hash_data: bool,
    /// Compute duplicate groups (implies content hashing).
    pub detect_duplicates: bool,
    /// Classify live files as UTF-8 text.
    pub detect_utf8: bool,
    /// Record unchanged entries under their layer for lineage.
    pub record_unchanged: bool,
    pub matchers: MatcherSet,
}

impl XrayOptions {
    fn hashing_enabled(&self) -> bool {
        // Duplicate detection cannot be retrofitted after the scan, so it
        // forces hashing on.
        self.hash_data || self.detect_duplicates
    }
}

/// Analysis of one filesystem layer.
#[derive(Debug, Serialize)]
pub struct LayerReport {
    pub index: usize,
    pub id: String,
    pub digest: String,
    pub command: String,
    pub created: String,
    /// Every object the layer touched, physical tar order.
    pub objects: Vec<ObjectMetadata>,
    /// Indices into `objects`, filtered by configured matchers.
    pub added: Vec<usize>,
    pub modified: Vec<usize>,
    /// Deletions are never content-matched; this list is unfiltered.
    pub deleted: Vec<usize>,
    /// Path -> data patterns that matched its content.
    pub data_matches: BTreeMap<String, Vec<String>>,
    /// Paths whose content hash matched a hash matcher.
    pub hash_matches: Vec<String>,
    pub stats: LayerStats,
    pub top: Vec<TopObject>,
    pub distro: Option<DistroInfo>,
}

/// Cross-layer aggregate counters (raw classification, pre-matcher).
#[derive(Debug, Default, Clone, Serialize)]
pub struct PackageStats {
    pub layer_count: usize,
    pub object_count: usize,
    pub added_count: usize,
    pub modified_count: usize,
    pub deleted_count: usize,
    pub added_size: u64,
    pub modified_size: u64,
    pub deleted_size: u64,
    pub duplicate_group_count: usize,
    pub duplicate_wasted: u64,
}

/// The full analysis result of one image.
#[derive(Debug, Serialize)]
pub struct Package {
    pub image: ImageConfigInfo,
    pub layers: Vec<LayerReport>,
    pub duplicates: Vec<DuplicateGroup>,
    pub special_perms: SpecialPermRefs,
    pub os_shells: Vec<String>,
    pub certs: CertsInfo,
    pub utf8_text_paths: Vec<String>,
    pub distro: Option<DistroInfo>,
    /// Detector name -> error, for sub-passes that failed.
    pub detector_errors: BTreeMap<String, String>,
    pub stats: PackageStats,
    #[serde(skip)]
    pub hash_references: HashReferences,
}

/// Loads and analyzes one exported image tarball.
pub fn load_package(
    tarball: &Path,
    options: &XrayOptions,
    notifier: &Notifier,
) -> Result<Package> {
    let image = ExtractedImage::from_tarball(tarball, notifier)?;
    let blobs = image.blob_layers();

    notifier.info(&format!("indexing {} filesystem layers", blobs.len()));
    let bar = notifier.layer_progress(blobs.len() as u64, "indexing");
    let mut indexes: Vec<TarIndex> = Vec::with_capacity(blobs.len());
    for blob in &blobs {
        let Some(path) = &blob.tarball_path else {
            continue;
        };
        let index = TarIndex::open(path)
            .with_context(|| format!("failed to index layer {}", blob.digest))?;
        indexes.push(index);
        if let Some(bar) = &bar {
            bar.inc(1);
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    notifier.info("diffing layers");
    let outcome = diff_layers(&indexes, options.record_unchanged);

    let mut hash_refs = HashReferences::default();
    let mut special_perms = SpecialPermRefs::default();
    let mut pkg_stats = PackageStats {
        layer_count: outcome.layers.len(),
        ..Default::default()
    };

    let mut reports: Vec<LayerReport> = Vec::with_capacity(outcome.layers.len());
    for (layer_idx, changes) in outcome.layers.into_iter().enumerate() {
        let index = &indexes[layer_idx];
        let blob = blobs[layer_idx];
        let mut objects = changes.objects;

        let mut data_matches: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut hash_matches: Vec<String> = Vec::new();
        let mut admitted = vec![true; objects.len()];

        // Deletions are reported unconditionally: their content is gone.
        let eval_targets: Vec<usize> = changes
            .added
            .iter()
            .chain(&changes.modified)
            .copied()
            .collect();
        for i in eval_targets {
            let result = options.matchers.evaluate(&objects[i], index)?;
            if !result.path_matched.is_empty() {
                objects[i].path_match = true;
            }
            if !result.data_matched.is_empty() {
                data_matches.insert(objects[i].name.clone(), result.data_matched.clone());
            }
            if result.hash_matched {
                hash_matches.push(objects[i].name.clone());
            }
            admitted[i] = result.admits(&options.matchers);
        }

        let added: Vec<usize> = changes.added.iter().copied().filter(|&i| admitted[i]).collect();
        let modified: Vec<usize> = changes
            .modified
            .iter()
            .copied()
            .filter(|&i| admitted[i])
            .collect();

        let mut layer_stats = LayerStats::default();
        for obj in &objects {
            layer_stats.record_object(obj);
            special_perms.record(obj.mode, &obj.name);
        }
        for &i in &changes.added {
            layer_stats.added_size += objects[i].size;
        }
        for &i in &changes.modified {
            layer_stats.modified_size += objects[i].size;
        }
        for &i in &changes.deleted {
            layer_stats.deleted_size += objects[i].size;
        }

        if options.hashing_enabled() {
            for &i in changes.added.iter().chain(&changes.modified) {
                let obj = &objects[i];
                if let Some(h) = obj.hash {
                    hash_refs.record(h, &obj.name, obj.size);
                }
            }
        }

        let mut top = TopObjects::new(options.top_changes_max);
        for &i in added.iter().chain(&modified) {
            let obj = &objects[i];
            if obj.size > 0 {
                top.offer(obj.size, &obj.name);
            }
        }

        pkg_stats.object_count += objects.len();
        pkg_stats.added_count += changes.added.len();
        pkg_stats.modified_count += changes.modified.len();
        pkg_stats.deleted_count += changes.deleted.len();
        pkg_stats.added_size += layer_stats.added_size;
        pkg_stats.modified_size += layer_stats.modified_size;
        pkg_stats.deleted_size += layer_stats.deleted_size;

        reports.push(LayerReport {
            index: layer_idx,
            id: blob.id.clone(),
            digest: blob.digest.clone(),
            command: blob.command.clone(),
            created: blob.created_at.to_rfc3339(),
            objects,
            added,
            modified,
            deleted: changes.deleted,
            data_matches,
            hash_matches,
            stats: layer_stats,
            top: top.into_sorted(),
            distro: layer_distro(index),
        });
    }

    // Detector sub-passes are independently optional; one failing does not
    // abort the others.
    let mut detector_errors: BTreeMap<String, String> = BTreeMap::new();

    let os_shells = detectors::detect_shells(&outcome.live).unwrap_or_else(|err| {
        detector_errors.insert("shells".to_string(), err.to_string());
        Vec::new()
    });
    let certs = detectors::detect_certs(&outcome.live).unwrap_or_else(|err| {
        detector_errors.insert("certs".to_string(), err.to_string());
        CertsInfo::default()
    });
    let distro = detectors::detect_distro(&outcome.live, &indexes).unwrap_or_else(|err| {
        detector_errors.insert("distro".to_string(), err.to_string());
        None
    });
    let utf8_text_paths = if options.detect_utf8 {
        detectors::detect_utf8(&outcome.live, &indexes).unwrap_or_else(|err| {
            detector_errors.insert("utf8".to_string(), err.to_string());
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let duplicates = if options.detect_duplicates {
        hash_refs.duplicate_groups()
    } else {
        Vec::new()
    };
    pkg_stats.duplicate_group_count = duplicates.len();
    pkg_stats.duplicate_wasted = duplicates.iter().map(|g| g.wasted).sum();

    notifier.finish();

    Ok(Package {
        image: image.config().clone(),
        layers: reports,
        duplicates,
        special_perms,
        os_shells,
        certs,
        utf8_text_paths,
        distro,
        detector_errors,
        stats: pkg_stats,
        hash_references: hash_refs,
    })
}

/// Distro identity as carried by this single layer, if it ships os-release.
fn layer_distro(index: &TarIndex) -> Option<DistroInfo> {
    for candidate in ["etc/os-release", "usr/lib/os-release"] {
        if let Some(meta) = index.get(candidate) {
            if let Ok(data) = index.read_entry(meta) {
                if let Some(info) = detectors::parse_os_release(&String::from_utf8_lossy(&data)) {
                    return Some(info);
                }
            }
        }
    }
    None
}
