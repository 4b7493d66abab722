//! In-memory bundle catalog.
//!
//! Destination → priority → expiration-ordered map → FIFO of catalog
//! entries. The next bundle to release is always at the front of some FIFO,
//! found in O(log n). The catalog is owned and mutated by the router thread
//! only; entries are move-only and their chain ownership travels with them
//! (catalog → read session → back, or to the awaiting-ack map, or dissolved
//! when the bundle is removed from disk).

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::codec::primary::NUM_PRIORITIES;
use crate::eid::Eid;
use crate::segment::SegmentId;

/// One stored bundle: its segment chain plus the metadata release needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub bundle_size: u64,
    pub chain: Vec<SegmentId>,
    pub dest: Eid,
    pub src: Eid,
    pub priority_index: usize,
    pub abs_expiration: u64,
    /// Custody id this node assigned for tracking at the next hop.
    pub custody_id: u64,
    pub has_custody: bool,
    /// (creation time, sequence) of the source transmission request.
    pub creation_timestamp: (u64, u64),
}

/// (source eid, creation time, sequence): what a custody signal names.
pub type BundleUuid = (Eid, u64, u64);

impl CatalogEntry {
    pub fn uuid(&self) -> BundleUuid {
        (self.src, self.creation_timestamp.0, self.creation_timestamp.1)
    }
}

type ExpirationMap = BTreeMap<u64, VecDeque<CatalogEntry>>;
type PriorityVec = [ExpirationMap; NUM_PRIORITIES];

#[derive(Debug, Default)]
pub struct BundleCatalog {
    dest_map: BTreeMap<Eid, PriorityVec>,
    /// Bundles streamed to egress and awaiting acknowledgement, by custody id.
    awaiting_ack: HashMap<u64, CatalogEntry>,
    /// Custody signals identify bundles by uuid, not custody id.
    awaiting_ack_by_uuid: HashMap<BundleUuid, u64>,
}

impl BundleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits an entry at the tail of its (dest, priority, expiration) FIFO.
    pub fn insert(&mut self, entry: CatalogEntry) {
        debug_assert!(!entry.chain.is_empty());
        debug_assert!(entry.priority_index < NUM_PRIORITIES);
        self.dest_map
            .entry(entry.dest)
            .or_default()[entry.priority_index]
            .entry(entry.abs_expiration)
            .or_default()
            .push_back(entry);
    }

    /// Removes and returns the next entry to release among `dests`.
    ///
    /// Highest priority first; within a priority, the destination whose
    /// FIFO front has the smallest expiration (ties go to the earlier
    /// destination in `dests`); within one FIFO, insertion order.
    pub fn pop_top(&mut self, dests: &[Eid]) -> Option<CatalogEntry> {
        for priority in (0..NUM_PRIORITIES).rev() {
            let mut best: Option<(Eid, u64)> = None;
            for dest in dests {
                let Some(priority_vec) = self.dest_map.get(dest) else {
                    continue;
                };
                if let Some((&expiration, _)) = priority_vec[priority].iter().next() {
                    if best.map_or(true, |(_, lowest)| expiration < lowest) {
                        best = Some((*dest, expiration));
                    }
                }
            }
            if let Some((dest, expiration)) = best {
                let expiration_map =
                    &mut self.dest_map.get_mut(&dest).expect("dest vanished")[priority];
                let fifo = expiration_map
                    .get_mut(&expiration)
                    .expect("expiration key vanished");
                let entry = fifo.pop_front().expect("empty fifo left in catalog");
                if fifo.is_empty() {
                    expiration_map.remove(&expiration);
                }
                return Some(entry);
            }
        }
        None
    }

    /// Puts a popped entry back, at the tail of the same expiration FIFO.
    /// Later pops still see it before anything written afterwards at a
    /// higher expiration.
    pub fn return_top(&mut self, entry: CatalogEntry) {
        self.insert(entry);
    }

    /// Parks a released entry until egress acknowledges its custody id.
    pub fn mark_released(&mut self, entry: CatalogEntry) -> bool {
        let custody_id = entry.custody_id;
        if self.awaiting_ack.contains_key(&custody_id) {
            return false;
        }
        self.awaiting_ack_by_uuid.insert(entry.uuid(), custody_id);
        self.awaiting_ack.insert(custody_id, entry);
        true
    }

    pub fn take_awaiting_ack(&mut self, custody_id: u64) -> Option<CatalogEntry> {
        let entry = self.awaiting_ack.remove(&custody_id)?;
        self.awaiting_ack_by_uuid.remove(&entry.uuid());
        Some(entry)
    }

    /// Custody id of a released bundle a custody signal refers to.
    pub fn custody_id_for_uuid(&self, uuid: &BundleUuid) -> Option<u64> {
        self.awaiting_ack_by_uuid.get(uuid).copied()
    }

    /// Entries currently queued for release (excluding awaiting-ack ones).
    pub fn queued_count(&self) -> usize {
        self.dest_map
            .values()
            .flat_map(|priorities| priorities.iter())
            .flat_map(|by_expiration| by_expiration.values())
            .map(|fifo| fifo.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dest: Eid, priority: usize, expiration: u64, custody_id: u64) -> CatalogEntry {
        CatalogEntry {
            bundle_size: 100,
            chain: vec![custody_id as u32],
            dest,
            src: Eid::new(100, 1),
            priority_index: priority,
            abs_expiration: expiration,
            custody_id,
            has_custody: false,
            creation_timestamp: (0, custody_id),
        }
    }

    #[test]
    fn pops_highest_priority_first() {
        let dest = Eid::new(1, 1);
        let mut catalog = BundleCatalog::new();
        catalog.insert(entry(dest, 0, 5, 1));
        catalog.insert(entry(dest, 2, 9, 2));
        catalog.insert(entry(dest, 1, 1, 3));

        let order: Vec<u64> = std::iter::from_fn(|| catalog.pop_top(&[dest]))
            .map(|e| e.custody_id)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn pops_lowest_expiration_within_priority() {
        let dest = Eid::new(1, 1);
        let mut catalog = BundleCatalog::new();
        catalog.insert(entry(dest, 1, 30, 1));
        catalog.insert(entry(dest, 1, 10, 2));
        catalog.insert(entry(dest, 1, 20, 3));

        let order: Vec<u64> = std::iter::from_fn(|| catalog.pop_top(&[dest]))
            .map(|e| e.custody_id)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn fifo_within_one_expiration() {
        let dest = Eid::new(1, 1);
        let mut catalog = BundleCatalog::new();
        for custody_id in 1..=4 {
            catalog.insert(entry(dest, 0, 7, custody_id));
        }
        let order: Vec<u64> = std::iter::from_fn(|| catalog.pop_top(&[dest]))
            .map(|e| e.custody_id)
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn restricts_to_requested_destinations() {
        let released = Eid::new(1, 1);
        let held = Eid::new(2, 1);
        let mut catalog = BundleCatalog::new();
        catalog.insert(entry(held, 2, 0, 1));
        catalog.insert(entry(released, 0, 50, 2));

        assert_eq!(catalog.pop_top(&[released]).unwrap().custody_id, 2);
        assert!(catalog.pop_top(&[released]).is_none());
        assert_eq!(catalog.pop_top(&[held, released]).unwrap().custody_id, 1);
    }

    #[test]
    fn expiration_ties_resolve_by_destination_order() {
        let first = Eid::new(1, 1);
        let second = Eid::new(2, 1);
        let mut catalog = BundleCatalog::new();
        catalog.insert(entry(second, 1, 5, 1));
        catalog.insert(entry(first, 1, 5, 2));

        assert_eq!(catalog.pop_top(&[first, second]).unwrap().custody_id, 2);
        assert_eq!(catalog.pop_top(&[first, second]).unwrap().custody_id, 1);
    }

    #[test]
    fn return_top_keeps_fifo_position_ahead_of_newer_writes() {
        let dest = Eid::new(1, 1);
        let mut catalog = BundleCatalog::new();
        catalog.insert(entry(dest, 0, 5, 1));
        let popped = catalog.pop_top(&[dest]).unwrap();
        catalog.insert(entry(dest, 0, 9, 2));
        catalog.return_top(popped);

        assert_eq!(catalog.pop_top(&[dest]).unwrap().custody_id, 1);
        assert_eq!(catalog.pop_top(&[dest]).unwrap().custody_id, 2);
    }

    #[test]
    fn awaiting_ack_round_trip() {
        let dest = Eid::new(1, 1);
        let mut catalog = BundleCatalog::new();
        catalog.insert(entry(dest, 0, 5, 77));
        let popped = catalog.pop_top(&[dest]).unwrap();
        let uuid = popped.uuid();
        assert!(catalog.mark_released(popped));
        assert!(catalog.pop_top(&[dest]).is_none());
        assert_eq!(catalog.custody_id_for_uuid(&uuid), Some(77));

        let back = catalog.take_awaiting_ack(77).unwrap();
        assert_eq!(back.custody_id, 77);
        assert!(catalog.take_awaiting_ack(77).is_none());
        assert_eq!(catalog.custody_id_for_uuid(&uuid), None);
    }

    #[test]
    fn empty_expiration_keys_are_erased() {
        let dest = Eid::new(1, 1);
        let mut catalog = BundleCatalog::new();
        catalog.insert(entry(dest, 1, 5, 1));
        catalog.pop_top(&[dest]).unwrap();
        assert_eq!(catalog.queued_count(), 0);
        assert!(catalog.dest_map.get(&dest).unwrap()[1].is_empty());
    }
}
