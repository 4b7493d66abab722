//! End-to-end router flow over the in-process fabric: store acks, release
//! gating by the per-destination admission cap, and deletion on egress ack.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use bundlestore::messages::{
    EgressAckHdr, IreleaseHdr, StorageAckHdr, ToEgressHdr, ToStorageHdr, MSG_TYPE_SHUTDOWN,
    TO_EGRESS_HDR_SIZE,
};
use bundlestore::{
    BundleStorageManager, Eid, NoopCustody, ReadSession, SegmentAllocator, StorageRouter,
    inproc_fabric,
};
use common::{bundle_of_exact_size, primary_v6, test_config};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// Long enough for several router poll cycles to pass without traffic.
const QUIET: Duration = Duration::from_millis(400);

const DEST: Eid = Eid::new(50, 1);
const CAP: usize = 5;
const BUNDLES: usize = 8;

#[test]
fn store_release_ack_flow_with_admission_cap() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path(), 2, 256);
    let total_segments = config.total_segments();
    let engine = BundleStorageManager::new(config)?;

    let (fabric, peer) = inproc_fabric();
    let mut router = StorageRouter::new(engine, fabric, NoopCustody);
    let stop = router.stop_flag();
    let handle = std::thread::spawn(move || {
        router.run().expect("storage router failed");
        router.into_engine()
    });

    // store 8 bundles before anything is released
    let mut sent_bundles = Vec::new();
    for i in 0..BUNDLES as u64 {
        let primary = primary_v6(DEST, 0, 0, i);
        let bundle = bundle_of_exact_size(&primary, 2048, i as u8);
        let mut frame = ToStorageHdr {
            ingress_unique_id: i,
        }
        .to_bytes()
        .to_vec();
        frame.extend_from_slice(&bundle);
        peer.to_storage.send(frame)?;
        sent_bundles.push(bundle);

        let ack_frame = peer.from_storage_to_ingress.recv_timeout(RECV_TIMEOUT)?;
        let ack = StorageAckHdr::from_bytes(&ack_frame).unwrap();
        assert_eq!(ack.ingress_unique_id, i);
        assert_eq!(ack.error, 0);
        assert_eq!(ack.final_dest_eid, DEST);
    }

    // nothing flows before the destination is released
    assert!(peer
        .from_storage_to_egress
        .recv_timeout(QUIET)
        .is_err());

    peer.to_storage.send(
        IreleaseHdr {
            start: true,
            final_dest_eid: DEST,
        }
        .to_bytes()
        .to_vec(),
    )?;

    // exactly CAP bundles arrive, in expiration order, then the link clogs
    let mut first_wave = Vec::new();
    for _ in 0..CAP {
        let frame = peer.from_storage_to_egress.recv_timeout(RECV_TIMEOUT)?;
        let hdr = ToEgressHdr::from_bytes(&frame).unwrap();
        assert_eq!(hdr.final_dest_eid, DEST);
        assert!(!hdr.has_custody);
        first_wave.push((hdr.custody_id, frame[TO_EGRESS_HDR_SIZE..].to_vec()));
    }
    assert!(peer.from_storage_to_egress.recv_timeout(QUIET).is_err());

    for (i, (_, bundle)) in first_wave.iter().enumerate() {
        assert_eq!(bundle, &sent_bundles[i], "bundle {i} released out of order");
    }

    // acking the first wave lets the remaining three through
    for &(custody_id, _) in &first_wave {
        peer.to_storage.send(
            EgressAckHdr {
                final_dest_eid: DEST,
                custody_id,
                delete_now: true,
            }
            .to_bytes()
            .to_vec(),
        )?;
    }
    let mut second_wave = Vec::new();
    for i in CAP..BUNDLES {
        let frame = peer.from_storage_to_egress.recv_timeout(RECV_TIMEOUT)?;
        let hdr = ToEgressHdr::from_bytes(&frame).unwrap();
        assert_eq!(&frame[TO_EGRESS_HDR_SIZE..], &sent_bundles[i]);
        second_wave.push(hdr.custody_id);
    }
    assert!(peer.from_storage_to_egress.recv_timeout(QUIET).is_err());

    for custody_id in second_wave {
        peer.to_storage.send(
            EgressAckHdr {
                final_dest_eid: DEST,
                custody_id,
                delete_now: true,
            }
            .to_bytes()
            .to_vec(),
        )?;
    }

    // shut the router down and inspect the engine
    let mut shutdown = vec![0u8; 4];
    shutdown[0..2].copy_from_slice(&MSG_TYPE_SHUTDOWN.to_le_bytes());
    peer.to_storage.send(shutdown)?;
    let mut engine = handle.join().expect("router thread panicked");
    stop.store(false, Ordering::Release);

    // every bundle was deleted after its ack, so storage is empty again
    engine.start()?;
    let mut read = ReadSession::new();
    assert_eq!(engine.pop_top(&mut read, &[DEST]), 0);
    let fresh = SegmentAllocator::new(total_segments).snapshot()?;
    assert!(engine.allocator().is_backup_equal(&fresh)?);

    Ok(())
}

#[test]
fn exhausted_store_is_acked_with_an_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = BundleStorageManager::new(test_config(dir.path(), 1, 2))?;

    let (fabric, peer) = inproc_fabric();
    let mut router = StorageRouter::new(engine, fabric, NoopCustody);
    let stop = router.stop_flag();
    let handle = std::thread::spawn(move || router.run());

    let primary = primary_v6(DEST, 0, 0, 1);
    let bundle = bundle_of_exact_size(&primary, 4 * 4096, 1); // larger than the store
    let mut frame = ToStorageHdr {
        ingress_unique_id: 7,
    }
    .to_bytes()
    .to_vec();
    frame.extend_from_slice(&bundle);
    peer.to_storage.send(frame)?;

    let ack_frame = peer.from_storage_to_ingress.recv_timeout(RECV_TIMEOUT)?;
    let ack = StorageAckHdr::from_bytes(&ack_frame).unwrap();
    assert_eq!(ack.ingress_unique_id, 7);
    assert_ne!(ack.error, 0);
    assert_eq!(ack.final_dest_eid, DEST);

    stop.store(false, Ordering::Release);
    handle.join().expect("router thread panicked")?;
    Ok(())
}
