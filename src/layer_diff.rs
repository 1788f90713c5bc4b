//! Layer-by-layer change classification over an ordered stack of tar indexes.
//!
//! Replays layers oldest to newest against a running live view of the image
//! filesystem. Every path in a layer is classified as Added, Modified or
//! Deleted relative to the cumulative prior state; whiteout markers (`.wh.*`)
//! and opaque-directory markers (`.wh..wh..opq`) are interpreted as deletions
//! per the OCI layer format.

use crate::objects::{ObjectHistory, ObjectMetadata};
use crate::tar_index::{TarEntryMeta, TarIndex};
use log::debug;
use std::collections::{BTreeMap, HashMap};

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// A whiteout marker decoded from an entry path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Whiteout {
    /// `.wh.<name>` — deletes `<dir>/<name>` and everything under it.
    Path(String),
    /// `.wh..wh..opq` — deletes everything under the marker's directory.
    Opaque(String),
}

/// Decodes a normalized entry path into a whiteout, if it is one.
pub fn whiteout_target(name: &str) -> Option<Whiteout> {
    let (dir, base) = match name.rsplit_once('/') {
        Some((d, b)) => (d, b),
        None => ("", name),
    };
    if base == OPAQUE_MARKER {
        return Some(Whiteout::Opaque(dir.to_string()));
    }
    if let Some(stripped) = base.strip_prefix(WHITEOUT_PREFIX) {
        let target = if dir.is_empty() {
            stripped.to_string()
        } else {
            format!("{dir}/{stripped}")
        };
        return Some(Whiteout::Path(target));
    }
    None
}

#[derive(Debug, Clone)]
struct LiveEntry {
    entry_type: u8,
    size: u64,
    mode: u32,
    uid: u64,
    gid: u64,
    mtime: u64,
    hash: Option<u64>,
    link_target: Option<String>,
    layer: usize,
}

impl LiveEntry {
    fn from_meta(meta: &TarEntryMeta, layer: usize) -> Self {
        LiveEntry {
            entry_type: meta.entry_type,
            size: meta.size,
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            mtime: meta.mtime,
            hash: meta.hash,
            link_target: meta.link_target.clone(),
            layer,
        }
    }

    fn same_content(&self, meta: &TarEntryMeta) -> bool {
        self.entry_type == meta.entry_type && self.size == meta.size && self.hash == meta.hash
    }

    fn into_deleted_object(self, name: String) -> ObjectMetadata {
        ObjectMetadata {
            name,
            entry_type: self.entry_type,
            size: self.size,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            mtime: self.mtime,
            hash: self.hash,
            link_target: self.link_target,
            history: ObjectHistory::default(),
            path_match: false,
        }
    }
}

/// Per-layer change sets. `added`/`modified`/`deleted` are indices into
/// `objects`, preserving the tar's physical occurrence order.
#[derive(Debug, Default)]
pub struct LayerChanges {
    pub objects: Vec<ObjectMetadata>,
    pub added: Vec<usize>,
    pub modified: Vec<usize>,
    pub deleted: Vec<usize>,
}

/// Result of diffing a whole layer stack.
pub struct DiffOutcome {
    pub layers: Vec<LayerChanges>,
    /// Paths live after the last layer, mapped to the layer that last
    /// provided their content.
    pub live: BTreeMap<String, usize>,
}

/// Diffs an ordered stack of layer indexes (oldest first).
///
/// When `record_unchanged` is set, entries identical to the live view are
/// still recorded under the layer (for lineage) without appearing in any
/// change list.
pub fn diff_layers(indexes: &[TarIndex], record_unchanged: bool) -> DiffOutcome {
    let mut live: HashMap<String, LiveEntry> = HashMap::new();
    let mut histories: HashMap<String, ObjectHistory> = HashMap::new();
    let mut layers: Vec<LayerChanges> = Vec::with_capacity(indexes.len());

    for (layer_idx, index) in indexes.iter().enumerate() {
        let mut changes = LayerChanges::default();

        for meta in index.iter_order() {
            match whiteout_target(&meta.name) {
                Some(Whiteout::Path(target)) => {
                    let mut doomed = Vec::new();
                    if live.contains_key(&target) {
                        doomed.push(target.clone());
                    }
                    // A whiteout on a directory takes its subtree with it.
                    let prefix = format!("{target}/");
                    doomed.extend(live.keys().filter(|k| k.starts_with(&prefix)).cloned());

                    if doomed.is_empty() {
                        debug!(
                            "layer {layer_idx}: whiteout for path never added, ignoring: {target}"
                        );
                        continue;
                    }
                    delete_paths(&mut live, &mut histories, &mut changes, doomed, layer_idx);
                }
                Some(Whiteout::Opaque(dir)) => {
                    let prefix = if dir.is_empty() {
                        String::new()
                    } else {
                        format!("{dir}/")
                    };
                    let doomed: Vec<String> = live
                        .keys()
                        .filter(|k| k.starts_with(&prefix) && k.as_str() != dir)
                        .cloned()
                        .collect();
                    if doomed.is_empty() {
                        debug!("layer {layer_idx}: opaque marker over empty dir: {dir}");
                        continue;
                    }
                    delete_paths(&mut live, &mut histories, &mut changes, doomed, layer_idx);
                }
                None => match live.get(&meta.name) {
                    None => {
                        histories
                            .entry(meta.name.clone())
                            .or_default()
                            .record_add(layer_idx);
                        live.insert(meta.name.clone(), LiveEntry::from_meta(meta, layer_idx));
                        let idx = changes.objects.len();
                        changes.objects.push(ObjectMetadata::from_entry(meta));
                        changes.added.push(idx);
                    }
                    Some(prev) if prev.same_content(meta) => {
                        if record_unchanged {
                            changes.objects.push(ObjectMetadata::from_entry(meta));
                        }
                    }
                    Some(_) => {
                        histories
                            .entry(meta.name.clone())
                            .or_default()
                            .record_modify(layer_idx);
                        live.insert(meta.name.clone(), LiveEntry::from_meta(meta, layer_idx));
                        let idx = changes.objects.len();
                        changes.objects.push(ObjectMetadata::from_entry(meta));
                        changes.modified.push(idx);
                    }
                },
            }
        }

        layers.push(changes);
    }

    // Back-patch the finished cross-layer history into every recorded object.
    for layer in &mut layers {
        for obj in &mut layer.objects {
            if let Some(history) = histories.get(&obj.name) {
                obj.history = history.clone();
            }
        }
    }

    let live_map = live
        .into_iter()
        .map(|(name, entry)| (name, entry.layer))
        .collect();

    DiffOutcome {
        layers,
        live: live_map,
    }
}

fn delete_paths(
    live: &mut HashMap<String, LiveEntry>,
    histories: &mut HashMap<String, ObjectHistory>,
    changes: &mut LayerChanges,
    doomed: Vec<String>,
    layer_idx: usize,
) {
    for target in doomed {
        let Some(prev) = live.remove(&target) else {
            continue;
        };
        histories
            .entry(target.clone())
            .or_default()
            .record_delete(layer_idx);
        let idx = changes.objects.len();
        changes.objects.push(prev.into_deleted_object(target));
        changes.deleted.push(idx);
    }
}
