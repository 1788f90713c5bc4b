//! Cross-layer object metadata and per-path change history.

use crate::tar_index::TarEntryMeta;
use serde::Serialize;

/// Reference to an image layer by 0-based build-order index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayerRef {
    pub layer: usize,
}

/// How a layer touched an object, relative to the cumulative prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// Layer-by-layer lifecycle of a single path.
///
/// Invariant: `add` (if present) precedes every entry of `modifies`, which is
/// ascending, and `delete` (if present) follows them all.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObjectHistory {
    pub add: Option<LayerRef>,
    pub modifies: Vec<LayerRef>,
    pub delete: Option<LayerRef>,
}

impl ObjectHistory {
    pub fn record_add(&mut self, layer: usize) {
        if self.add.is_none() {
            self.add = Some(LayerRef { layer });
        } else {
            // Re-appearing after a delete: the add slot is taken, so the
            // reappearance lands in the modify chain and the delete clears.
            self.delete = None;
            self.modifies.push(LayerRef { layer });
        }
    }

    pub fn record_modify(&mut self, layer: usize) {
        self.modifies.push(LayerRef { layer });
    }

    pub fn record_delete(&mut self, layer: usize) {
        self.delete = Some(LayerRef { layer });
    }

    pub fn is_live(&self) -> bool {
        self.delete.is_none()
    }
}

/// Materialized view of a filesystem object as of the latest layer that
/// touched it.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectMetadata {
    pub name: String,
    pub entry_type: u8,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub hash: Option<u64>,
    pub link_target: Option<String>,
    pub history: ObjectHistory,
    pub path_match: bool,
}

impl ObjectMetadata {
    pub fn from_entry(meta: &TarEntryMeta) -> Self {
        ObjectMetadata {
            name: meta.name.clone(),
            entry_type: meta.entry_type,
            size: meta.size,
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            mtime: meta.mtime,
            hash: meta.hash,
            link_target: meta.link_target.clone(),
            history: ObjectHistory::default(),
            path_match: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_records_lifecycle_in_order() {
        let mut history = ObjectHistory::default();
        history.record_add(0);
        history.record_modify(2);
        history.record_modify(4);
        history.record_delete(5);

        assert_eq!(history.add, Some(LayerRef { layer: 0 }));
        assert_eq!(
            history.modifies,
            vec![LayerRef { layer: 2 }, LayerRef { layer: 4 }]
        );
        assert_eq!(history.delete, Some(LayerRef { layer: 5 }));
        assert!(!history.is_live());
    }

    #[test]
    fn readd_after_delete_clears_delete() {
        let mut history = ObjectHistory::default();
        history.record_add(0);
        history.record_delete(1);
        history.record_add(3);

        assert_eq!(history.add, Some(LayerRef { layer: 0 }));
        assert_eq!(history.modifies, vec![LayerRef { layer: 3 }]);
        assert_eq!(history.delete, None);
        assert!(history.is_live());
    }
}
