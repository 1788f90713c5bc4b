//! Aggregate statistics over discovered objects: the content-hash dedup
//! index, duplicate wasted-size accounting, bounded top-N size tracking,
//! special-permission scanning and per-layer counters.

use crate::hash;
use crate::objects::ObjectMetadata;
use log::warn;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

/// Setuid bit in the tar mode field.
pub const MODE_SETUID: u32 = 0o4000;
/// Setgid bit.
pub const MODE_SETGID: u32 = 0o2000;
/// Sticky bit.
pub const MODE_STICKY: u32 = 0o1000;

/// Global content-hash index: hash -> path -> file size.
///
/// Populated incrementally while layers are scanned; a hash with more than
/// one distinct path forms a duplicate group.
#[derive(Debug, Default)]
pub struct HashReferences {
    map: HashMap<u64, BTreeMap<String, u64>>,
}

impl HashReferences {
    pub fn record(&mut self, hash: u64, path: &str, size: u64) {
        self.map
            .entry(hash)
            .or_default()
            .insert(path.to_string(), size);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn paths_for(&self, hash: u64) -> Option<&BTreeMap<String, u64>> {
        self.map.get(&hash)
    }

    /// Computes duplicate groups, largest waste first.
    ///
    /// Sizes within a group normally agree; when they do not (a 64-bit hash
    /// collision), the mismatch is logged and waste falls back to
    /// `sum(sizes) - max(sizes)`.
    pub fn duplicate_groups(&self) -> Vec<DuplicateGroup> {
        let mut groups: Vec<DuplicateGroup> = self
            .map
            .iter()
            .filter(|(_, paths)| paths.len() > 1)
            .map(|(&h, paths)| {
                let sizes: Vec<u64> = paths.values().copied().collect();
                let max = sizes.iter().copied().max().unwrap_or(0);
                let all_equal = sizes.iter().all(|&s| s == max);
                let wasted = if all_equal {
                    (sizes.len() as u64 - 1) * max
                } else {
                    warn!(
                        "size mismatch within duplicate group {}: {:?}",
                        hash::to_hex(h),
                        sizes
                    );
                    sizes.iter().sum::<u64>() - max
                };
                DuplicateGroup {
                    hash: h,
                    paths: paths.keys().cloned().collect(),
                    file_count: paths.len(),
                    file_size: max,
                    wasted,
                }
            })
            .collect();
        groups.sort_by(|a, b| b.wasted.cmp(&a.wasted).then_with(|| a.hash.cmp(&b.hash)));
        groups
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    #[serde(serialize_with = "crate::stats::hex_hash")]
    pub hash: u64,
    pub paths: Vec<String>,
    pub file_count: usize,
    pub file_size: u64,
    pub wasted: u64,
}

pub(crate) fn hex_hash<S: serde::Serializer>(h: &u64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hash::to_hex(*h))
}

/// One of the N largest objects in a layer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TopObject {
    pub size: u64,
    pub name: String,
}

/// Bounded tracker of the N largest objects by size.
///
/// Backed by a min-heap: once full, a new object only enters by evicting the
/// current minimum. Capacity 0 disables tracking.
#[derive(Debug)]
pub struct TopObjects {
    capacity: usize,
    heap: BinaryHeap<Reverse<(u64, String)>>,
}

impl TopObjects {
    pub fn new(capacity: usize) -> Self {
        TopObjects {
            capacity,
            heap: BinaryHeap::with_capacity(capacity),
        }
    }

    pub fn offer(&mut self, size: u64, name: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse((size, name.to_string())));
            return;
        }
        if let Some(Reverse((min_size, _))) = self.heap.peek() {
            if size > *min_size {
                self.heap.pop();
                self.heap.push(Reverse((size, name.to_string())));
            }
        }
    }

    /// Drains into a list sorted largest first.
    pub fn into_sorted(self) -> Vec<TopObject> {
        let mut items: Vec<TopObject> = self
            .heap
            .into_iter()
            .map(|Reverse((size, name))| TopObject { size, name })
            .collect();
        items.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));
        items
    }
}

/// Names of objects carrying setuid/setgid/sticky bits.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SpecialPermRefs {
    pub setuid: BTreeSet<String>,
    pub setgid: BTreeSet<String>,
    pub sticky: BTreeSet<String>,
}

impl SpecialPermRefs {
    pub fn record(&mut self, mode: u32, name: &str) {
        if mode & MODE_SETUID != 0 {
            self.setuid.insert(name.to_string());
        }
        if mode & MODE_SETGID != 0 {
            self.setgid.insert(name.to_string());
        }
        if mode & MODE_STICKY != 0 {
            self.sticky.insert(name.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.setuid.is_empty() && self.setgid.is_empty() && self.sticky.is_empty()
    }
}

/// Per-layer object counters and change sizes.
#[derive(Debug, Default, Clone, Serialize)]
pub struct LayerStats {
    pub object_count: usize,
    pub dir_count: usize,
    pub file_count: usize,
    pub link_count: usize,
    pub max_file_size: u64,
    pub added_size: u64,
    pub modified_size: u64,
    pub deleted_size: u64,
}

impl LayerStats {
    pub fn record_object(&mut self, obj: &ObjectMetadata) {
        self.object_count += 1;
        let entry_type = tar_rs::EntryType::new(obj.entry_type);
        if entry_type.is_dir() {
            self.dir_count += 1;
        } else if entry_type.is_symlink() || entry_type.is_hard_link() {
            self.link_count += 1;
        } else if entry_type.is_file() {
            self.file_count += 1;
            if obj.size > self.max_file_size {
                self.max_file_size = obj.size;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_group_accounting() {
        let mut refs = HashReferences::default();
        refs.record(0xaa, "a/one", 100);
        refs.record(0xaa, "b/two", 100);
        refs.record(0xaa, "c/three", 100);
        refs.record(0xbb, "unique", 5);

        let groups = refs.duplicate_groups();
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g.file_count, 3);
        assert_eq!(g.file_size, 100);
        assert_eq!(g.wasted, 200);
        assert_eq!(g.paths.len(), 3);
    }

    #[test]
    fn duplicate_size_mismatch_falls_back() {
        // A hash collision across different sizes must not panic and must
        // account waste conservatively.
        let mut refs = HashReferences::default();
        refs.record(0xcc, "x", 10);
        refs.record(0xcc, "y", 30);

        let groups = refs.duplicate_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].file_size, 30);
        assert_eq!(groups[0].wasted, 10);
    }

    #[test]
    fn same_path_recorded_twice_is_not_a_duplicate() {
        let mut refs = HashReferences::default();
        refs.record(0xdd, "same/path", 42);
        refs.record(0xdd, "same/path", 42);
        assert!(refs.duplicate_groups().is_empty());
    }

    #[test]
    fn top_objects_keeps_n_largest() {
        let mut top = TopObjects::new(3);
        for (size, name) in [
            (10, "small"),
            (500, "big"),
            (200, "mid"),
            (700, "bigger"),
            (1, "tiny"),
        ] {
            top.offer(size, name);
        }
        let sorted = top.into_sorted();
        let names: Vec<&str> = sorted.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["bigger", "big", "mid"]);
    }

    #[test]
    fn top_objects_zero_capacity_disabled() {
        let mut top = TopObjects::new(0);
        top.offer(100, "anything");
        assert!(top.into_sorted().is_empty());
    }

    #[test]
    fn special_perm_bits() {
        let mut refs = SpecialPermRefs::default();
        refs.record(0o4755, "usr/bin/passwd");
        refs.record(0o2755, "usr/bin/wall");
        refs.record(0o1777, "tmp");
        refs.record(0o644, "etc/hosts");

        assert!(refs.setuid.contains("usr/bin/passwd"));
        assert!(refs.setgid.contains("usr/bin/wall"));
        assert!(refs.sticky.contains("tmp"));
        assert_eq!(
            refs.setuid.len() + refs.setgid.len() + refs.sticky.len(),
            3
        );
    }
}
