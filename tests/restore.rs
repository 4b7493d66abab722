//! Restart recovery: the disk image alone rebuilds the allocator and the
//! catalog, deleted bundles stay deleted, and release order survives.

mod common;

use std::collections::HashMap;

use bundlestore::codec::primary::PrimaryFields;
use bundlestore::segment::{segments_required, PAYLOAD_PER_SEGMENT};
use bundlestore::{BundleStorageManager, Eid, ReadSession, StorageConfig, WriteSession};
use common::{bundle_of_exact_size, primary_v6, test_config};

const MAIN_DEST: Eid = Eid::new(1, 1);
const DOOMED_DEST: Eid = Eid::new(2, 1);
/// Index of the bundle that is deleted before the restart.
const DOOMED_INDEX: usize = 12;

fn grid_sizes() -> Vec<usize> {
    let payload = PAYLOAD_PER_SEGMENT;
    [1usize, 2, 1000]
        .into_iter()
        .flat_map(|segments| {
            [-2isize, -1, 0, 1, 2]
                .into_iter()
                .map(move |delta| (segments * payload).checked_add_signed(delta).unwrap())
        })
        .collect()
}

fn grid_primary(index: usize, size: usize) -> (PrimaryFields, Vec<u8>) {
    let dest = if index == DOOMED_INDEX {
        DOOMED_DEST
    } else {
        MAIN_DEST
    };
    let primary = primary_v6(dest, (index % 3) as u8, 0, index as u64);
    let bundle = bundle_of_exact_size(&primary, size, index as u8);
    (primary, bundle)
}

/// Pop order over one destination: priority descending, expiration
/// ascending. Expiration here is the grid index, so the order is fully
/// determined.
fn expected_pop_order(indices: impl Iterator<Item = usize>) -> Vec<usize> {
    let mut order: Vec<usize> = indices.collect();
    order.sort_by_key(|&i| (std::cmp::Reverse(i % 3), i));
    order
}

fn keep_files(config: &StorageConfig) -> StorageConfig {
    let mut config = config.clone();
    config.auto_delete_files_on_exit = false;
    config.try_to_restore_from_disk = false;
    config
}

#[test]
fn restart_round_trip_with_deleted_middle_bundle() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base_config = test_config(dir.path(), 4, 1310);

    let mut bundles_by_size: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut bytes_written = 0u64;
    let mut segments_written = 0u64;
    let snapshot_before;

    {
        let mut bsm = BundleStorageManager::new(keep_files(&base_config))?;
        bsm.start()?;

        let mut write = WriteSession::new();
        for (index, size) in grid_sizes().into_iter().enumerate() {
            let (primary, bundle) = grid_primary(index, size);
            bsm.push_all_segments(&mut write, &primary, index as u64, &bundle)?;
            if index != DOOMED_INDEX {
                bytes_written += bundle.len() as u64;
                segments_written += segments_required(bundle.len() as u64);
                bundles_by_size.insert(bundle.len() as u64, bundle);
            }
        }

        // delete a middle bundle, then remember the allocator state
        let mut read = ReadSession::new();
        let mut scratch = Vec::new();
        assert_ne!(bsm.pop_top(&mut read, &[DOOMED_DEST]), 0);
        bsm.read_all_segments(&mut read, &mut scratch)?;
        bsm.remove_read_bundle_from_disk(&mut read, false)?;

        snapshot_before = bsm.allocator().snapshot()?;
        assert!(bsm.allocator().is_backup_equal(&snapshot_before)?);
        bsm.stop();
    }

    // restart against the same files
    let mut restore_config = keep_files(&base_config);
    restore_config.try_to_restore_from_disk = true;
    restore_config.auto_delete_files_on_exit = true;
    let mut bsm = BundleStorageManager::new(restore_config)?;

    assert!(bsm.successfully_restored_from_disk());
    let stats = bsm.restore_stats();
    assert_eq!(stats.bundles, 15 - 1);
    assert_eq!(stats.bytes, bytes_written);
    assert_eq!(stats.segments, segments_written);
    assert!(bsm.allocator().is_backup_equal(&snapshot_before)?);

    bsm.start()?;

    // the deleted bundle does not resurface
    let mut read = ReadSession::new();
    assert_eq!(bsm.pop_top(&mut read, &[DOOMED_DEST]), 0);

    // the rest pop in the same priority/expiration order, byte-identical
    let expected =
        expected_pop_order((0..15).filter(|&i| i != DOOMED_INDEX));
    let mut read_back = Vec::new();
    for index in expected {
        let bytes_to_read = bsm.pop_top(&mut read, &[MAIN_DEST]);
        assert_ne!(bytes_to_read, 0, "missing bundle {index}");
        let entry = read.entry().unwrap();
        assert_eq!(entry.priority_index, index % 3);
        assert_eq!(entry.abs_expiration, index as u64);
        bsm.read_all_segments(&mut read, &mut read_back)?;
        assert_eq!(
            Some(&read_back),
            bundles_by_size.get(&bytes_to_read),
            "bundle {index} changed across restart"
        );
        bsm.remove_read_bundle_from_disk(&mut read, false)?;
    }
    assert_eq!(bsm.pop_top(&mut read, &[MAIN_DEST]), 0);

    Ok(())
}

#[test]
fn freed_segments_are_allocatable_after_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base_config = test_config(dir.path(), 2, 8);

    {
        let mut bsm = BundleStorageManager::new(keep_files(&base_config))?;
        bsm.start()?;
        let mut write = WriteSession::new();
        // fill all 16 segments with two bundles, then delete the first
        for (custody_id, lifetime) in [(1u64, 1u64), (2, 2)] {
            let primary = primary_v6(MAIN_DEST, 0, 0, lifetime);
            let bundle =
                bundle_of_exact_size(&primary, PAYLOAD_PER_SEGMENT * 8, custody_id as u8);
            bsm.push_all_segments(&mut write, &primary, custody_id, &bundle)?;
        }
        let mut read = ReadSession::new();
        let mut scratch = Vec::new();
        assert_ne!(bsm.pop_top(&mut read, &[MAIN_DEST]), 0);
        bsm.read_all_segments(&mut read, &mut scratch)?;
        bsm.remove_read_bundle_from_disk(&mut read, false)?;
        bsm.stop();
    }

    let mut restore_config = keep_files(&base_config);
    restore_config.try_to_restore_from_disk = true;
    restore_config.auto_delete_files_on_exit = true;
    let mut bsm = BundleStorageManager::new(restore_config)?;
    assert_eq!(bsm.restore_stats().bundles, 1);
    bsm.start()?;

    // the freed half of the store takes a new 8-segment bundle
    let primary = primary_v6(MAIN_DEST, 0, 0, 9);
    let bundle = bundle_of_exact_size(&primary, PAYLOAD_PER_SEGMENT * 8, 0x7e);
    let mut write = WriteSession::new();
    bsm.push_all_segments(&mut write, &primary, 3, &bundle)?;

    Ok(())
}
