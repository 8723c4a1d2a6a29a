//! Block extent → log entry interval map.
//!
//! Maps non-overlapping block extents to the log entries holding the newest
//! data for them. Inserting an entry occludes prior overlapping intervals:
//! fully covered intervals are removed, partially covered ones shrink, and
//! an interval strictly containing the new one splits in two (both halves
//! keep referring to the old entry). Reads and writeback walk the map;
//! retirement removes every interval of the retiring entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::entry::LogEntry;
use crate::extent::BlockExtent;

#[derive(Clone)]
struct MapSlot {
    end_block: u64,
    entry: Arc<LogEntry>,
}

#[derive(Default)]
pub(crate) struct WriteLogMap {
    // Keyed by start block; values never overlap.
    inner: Mutex<BTreeMap<u64, MapSlot>>,
}

impl WriteLogMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a map interval for the entry's whole extent, occluding any
    /// overlapped portions of prior entries.
    pub fn add_log_entry(&self, entry: &Arc<LogEntry>) {
        let mut inner = self.inner.lock();
        self.add_locked(&mut inner, entry);
    }

    pub fn add_log_entries(&self, entries: &[Arc<LogEntry>]) {
        let mut inner = self.inner.lock();
        for entry in entries {
            self.add_locked(&mut inner, entry);
        }
    }

    fn add_locked(&self, inner: &mut BTreeMap<u64, MapSlot>, entry: &Arc<LogEntry>) {
        let extent = entry.block_extent();
        trace!(%extent, "adding log entry to map");
        Self::occlude_locked(inner, extent);
        inner.insert(
            extent.start_block,
            MapSlot {
                end_block: extent.end_block,
                entry: entry.clone(),
            },
        );
        entry.map_ref_added();
    }

    /// Remove the overlapped portions of existing intervals, adjusting
    /// reference counts: removal decrements, a split increments, shrinking
    /// leaves the count unchanged.
    fn occlude_locked(inner: &mut BTreeMap<u64, MapSlot>, extent: BlockExtent) {
        for start in Self::overlapping_starts_locked(inner, extent) {
            let slot = inner.get(&start).expect("overlap key").clone();
            let old = BlockExtent::new(start, slot.end_block);
            if extent.start_block <= old.start_block {
                if extent.end_block >= old.end_block {
                    // Fully occluded.
                    inner.remove(&start);
                    slot.entry.map_ref_removed();
                } else {
                    // Occludes the old interval's low end.
                    inner.remove(&start);
                    inner.insert(extent.end_block + 1, slot);
                }
            } else if extent.end_block >= old.end_block {
                // Occludes the old interval's high end.
                inner.get_mut(&start).expect("overlap key").end_block =
                    extent.start_block - 1;
            } else {
                // Splits the old interval; both halves keep the old entry.
                inner.get_mut(&start).expect("overlap key").end_block =
                    extent.start_block - 1;
                inner.insert(
                    extent.end_block + 1,
                    MapSlot {
                        end_block: old.end_block,
                        entry: slot.entry.clone(),
                    },
                );
                slot.entry.map_ref_added();
            }
        }
    }

    fn overlapping_starts_locked(
        inner: &BTreeMap<u64, MapSlot>,
        extent: BlockExtent,
    ) -> Vec<u64> {
        let mut starts = Vec::new();
        for (&start, slot) in inner.range(..=extent.end_block).rev() {
            if slot.end_block < extent.start_block {
                break;
            }
            starts.push(start);
        }
        starts.reverse();
        starts
    }

    /// Remove every map interval referring to `entry`.
    pub fn remove_log_entry(&self, entry: &Arc<LogEntry>) {
        let mut inner = self.inner.lock();
        let extent = entry.block_extent();
        for start in Self::overlapping_starts_locked(&inner, extent) {
            let matches = Arc::ptr_eq(&inner.get(&start).expect("overlap key").entry, entry);
            if matches {
                inner.remove(&start);
                entry.map_ref_removed();
            }
        }
    }

    pub fn remove_log_entries(&self, entries: &[Arc<LogEntry>]) {
        for entry in entries {
            self.remove_log_entry(entry);
        }
    }

    /// Drop the cached view of `extent`: remove the overlapped portions of
    /// every interval in range. Used by invalidate and discard.
    pub fn invalidate_range(&self, extent: BlockExtent) {
        let mut inner = self.inner.lock();
        Self::occlude_locked(&mut inner, extent);
    }

    /// The map intervals overlapping `extent`, in ascending block order.
    pub fn find_map_entries(&self, extent: BlockExtent) -> Vec<(BlockExtent, Arc<LogEntry>)> {
        let inner = self.inner.lock();
        Self::overlapping_starts_locked(&inner, extent)
            .into_iter()
            .map(|start| {
                let slot = inner.get(&start).expect("overlap key");
                (
                    BlockExtent::new(start, slot.end_block),
                    slot.entry.clone(),
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start_block: u64, blocks: u64) -> Arc<LogEntry> {
        LogEntry::new_write(start_block * 512, blocks * 512)
    }

    #[test]
    fn disjoint_entries_coexist() {
        let map = WriteLogMap::new();
        let a = entry(0, 2);
        let b = entry(4, 2);
        map.add_log_entry(&a);
        map.add_log_entry(&b);
        assert_eq!(map.len(), 2);
        assert_eq!(a.referring_map_entries(), 1);
        let found = map.find_map_entries(BlockExtent::new(0, 7));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, BlockExtent::new(0, 1));
        assert_eq!(found[1].0, BlockExtent::new(4, 5));
    }

    #[test]
    fn exact_overwrite_replaces() {
        let map = WriteLogMap::new();
        let old = entry(2, 2);
        let new = entry(2, 2);
        map.add_log_entry(&old);
        map.add_log_entry(&new);
        assert_eq!(map.len(), 1);
        assert_eq!(old.referring_map_entries(), 0);
        assert_eq!(new.referring_map_entries(), 1);
        let found = map.find_map_entries(BlockExtent::new(0, 10));
        assert!(Arc::ptr_eq(&found[0].1, &new));
    }

    #[test]
    fn low_end_occlusion_shrinks() {
        let map = WriteLogMap::new();
        let old = entry(2, 4); // [2,5]
        let new = entry(0, 4); // [0,3]
        map.add_log_entry(&old);
        map.add_log_entry(&new);
        let found = map.find_map_entries(BlockExtent::new(0, 10));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, BlockExtent::new(0, 3));
        assert!(Arc::ptr_eq(&found[0].1, &new));
        assert_eq!(found[1].0, BlockExtent::new(4, 5));
        assert!(Arc::ptr_eq(&found[1].1, &old));
        assert_eq!(old.referring_map_entries(), 1);
    }

    #[test]
    fn high_end_occlusion_shrinks() {
        let map = WriteLogMap::new();
        let old = entry(0, 4); // [0,3]
        let new = entry(2, 4); // [2,5]
        map.add_log_entry(&old);
        map.add_log_entry(&new);
        let found = map.find_map_entries(BlockExtent::new(0, 10));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, BlockExtent::new(0, 1));
        assert!(Arc::ptr_eq(&found[0].1, &old));
        assert_eq!(found[1].0, BlockExtent::new(2, 5));
    }

    #[test]
    fn strict_containment_splits_and_bumps_refcount() {
        let map = WriteLogMap::new();
        let old = entry(0, 4); // [0,3]
        let new = entry(1, 2); // [1,2]
        map.add_log_entry(&old);
        map.add_log_entry(&new);
        let found = map.find_map_entries(BlockExtent::new(0, 3));
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].0, BlockExtent::new(0, 0));
        assert!(Arc::ptr_eq(&found[0].1, &old));
        assert_eq!(found[1].0, BlockExtent::new(1, 2));
        assert!(Arc::ptr_eq(&found[1].1, &new));
        assert_eq!(found[2].0, BlockExtent::new(3, 3));
        assert!(Arc::ptr_eq(&found[2].1, &old));
        assert_eq!(old.referring_map_entries(), 2);
        assert_eq!(new.referring_map_entries(), 1);
    }

    #[test]
    fn remove_log_entry_drops_all_its_intervals() {
        let map = WriteLogMap::new();
        let old = entry(0, 4);
        let new = entry(1, 2);
        map.add_log_entry(&old);
        map.add_log_entry(&new);
        map.remove_log_entry(&old);
        assert_eq!(old.referring_map_entries(), 0);
        let found = map.find_map_entries(BlockExtent::new(0, 3));
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0].1, &new));
    }

    #[test]
    fn invalidate_range_trims_partial_overlaps() {
        let map = WriteLogMap::new();
        let a = entry(0, 4); // [0,3]
        let b = entry(6, 2); // [6,7]
        map.add_log_entry(&a);
        map.add_log_entry(&b);
        map.invalidate_range(BlockExtent::new(2, 6));
        let found = map.find_map_entries(BlockExtent::new(0, 10));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, BlockExtent::new(0, 1));
        assert_eq!(found[1].0, BlockExtent::new(7, 7));
        assert_eq!(a.referring_map_entries(), 1);
        assert_eq!(b.referring_map_entries(), 1);
    }

    #[test]
    fn invalidate_range_inside_one_entry_splits() {
        let map = WriteLogMap::new();
        let a = entry(0, 6); // [0,5]
        map.add_log_entry(&a);
        map.invalidate_range(BlockExtent::new(2, 3));
        let found = map.find_map_entries(BlockExtent::new(0, 5));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, BlockExtent::new(0, 1));
        assert_eq!(found[1].0, BlockExtent::new(4, 5));
        assert_eq!(a.referring_map_entries(), 2);
        map.remove_log_entry(&a);
        assert_eq!(a.referring_map_entries(), 0);
        assert!(map.is_empty());
    }
}
