use std::path::Path;

use bundlestore::codec::primary::{
    build_bundle, bpv6_flags_with_priority, PrimaryFields, BPV6_VERSION,
};
use bundlestore::{DiskConfig, Eid, StorageConfig};

pub const TEST_SRC: Eid = Eid::new(100, 1);

pub fn test_config(dir: &Path, num_disks: u32, segments_per_disk: u32) -> StorageConfig {
    let disks = (0..num_disks)
        .map(|i| DiskConfig {
            file_path: dir.join(format!("map{i}.bin")),
            segments_per_disk,
        })
        .collect();
    let mut config = StorageConfig::new(disks);
    config.auto_delete_files_on_exit = true;
    config
}

pub fn primary_v6(dest: Eid, priority: u8, creation: u64, lifetime: u64) -> PrimaryFields {
    PrimaryFields {
        version: BPV6_VERSION,
        flags: bpv6_flags_with_priority(priority),
        dest,
        src: TEST_SRC,
        report_to: Eid::new(0, 0),
        custodian: Eid::new(0, 0),
        creation,
        sequence: 1,
        lifetime,
    }
}

/// Serializes a bundle whose total length is exactly `target` bytes, with a
/// recognizable payload pattern. The payload length is solved iteratively
/// because the encoded block overhead varies with it.
pub fn bundle_of_exact_size(primary: &PrimaryFields, target: usize, seed: u8) -> Vec<u8> {
    let probe = build_bundle(primary, &[]);
    assert!(
        target > probe.len(),
        "target {target} smaller than bundle overhead {}",
        probe.len()
    );
    let mut payload_len = target - probe.len();
    for _ in 0..8 {
        let payload: Vec<u8> = (0..payload_len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        let bundle = build_bundle(primary, &payload);
        if bundle.len() == target {
            return bundle;
        }
        payload_len = payload_len
            .checked_add_signed(target as isize - bundle.len() as isize)
            .expect("payload length underflow");
    }
    panic!("could not hit exact bundle size {target}");
}
