//! Integration tests for multi-peer table replication.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sst::{LayoutBuilder, NodeId, ShmProvider, Sst, SstConfig, TransportContext};

fn peer_table(base_port: u16, n: u32) -> BTreeMap<NodeId, SocketAddr> {
    (1..=n)
        .map(|id| {
            let addr = format!("127.0.0.1:{}", base_port + id as u16 - 1)
                .parse()
                .unwrap();
            (id, addr)
        })
        .collect()
}

// =============================================================================
// Counter replication
// =============================================================================

/// Every peer sets its counter to 100 and publishes the field; after the
/// sync barrier every peer reads [100, 100, 100].
#[test]
fn test_three_peer_counter_replication() {
    let peers = peer_table(47501, 3);

    let mut handles = Vec::new();
    for id in 1..=3 {
        let peers = peers.clone();
        handles.push(thread::spawn(move || {
            let config = SstConfig::new().with_local_id(id).with_peers(peers);
            let ctx =
                TransportContext::initialize(&config, Arc::new(ShmProvider::new())).unwrap();

            let mut layout = LayoutBuilder::new();
            let counter = layout.field::<u64>();
            let sst = Sst::new(&ctx, layout.finish()).unwrap();

            let me = sst.get_local_index();
            sst.write(counter, me, 100);
            sst.put_field(counter).unwrap();
            sst.sync_with_members().unwrap();

            let values: Vec<u64> = (0..3).map(|row| sst.read(counter, row)).collect();

            // Hold the table until every peer has read its mirrors.
            sst.sync_with_members().unwrap();
            values
        }));
    }

    for handle in handles {
        assert_eq!(handle.join().unwrap(), vec![100, 100, 100]);
    }
}

/// Whole-row put replicates every field at once, vector fields included.
#[test]
fn test_whole_row_put_replicates_all_fields() {
    let peers = peer_table(47505, 2);

    let mut handles = Vec::new();
    for id in 1..=2 {
        let peers = peers.clone();
        handles.push(thread::spawn(move || {
            let config = SstConfig::new().with_local_id(id).with_peers(peers);
            let ctx =
                TransportContext::initialize(&config, Arc::new(ShmProvider::new())).unwrap();

            let mut layout = LayoutBuilder::new();
            let scalar = layout.field::<u32>();
            let flags = layout.field::<bool>();
            let history = layout.vector_field::<u64>(4);
            let sst = Sst::new(&ctx, layout.finish()).unwrap();

            let me = sst.get_local_index();
            sst.write(scalar, me, id * 11);
            sst.write(flags, me, true);
            for slot in 0..4 {
                sst.write_vec(history, me, slot, id as u64 * 100 + slot as u64);
            }
            sst.put().unwrap();
            sst.sync_with_members().unwrap();

            for row in 0..2 {
                let owner = sst.member_id(row);
                assert_eq!(sst.read(scalar, row), owner * 11);
                assert!(sst.read(flags, row));
                for slot in 0..4 {
                    assert_eq!(
                        sst.read_vec(history, row, slot),
                        owner as u64 * 100 + slot as u64
                    );
                }
            }
            sst.sync_with_members().unwrap();
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

/// Repeated single-field puts from one origin arrive in issue order: the
/// mirror value only ever moves forward.
#[test]
fn test_puts_from_one_origin_are_monotonic() {
    let peers = peer_table(47507, 2);
    const UPDATES: u64 = 2000;

    let writer_peers = peers.clone();
    let writer = thread::spawn(move || {
        let config = SstConfig::new().with_local_id(1).with_peers(writer_peers);
        let ctx = TransportContext::initialize(&config, Arc::new(ShmProvider::new())).unwrap();
        let mut layout = LayoutBuilder::new();
        let counter = layout.field::<u64>();
        let sst = Sst::new(&ctx, layout.finish()).unwrap();

        sst.sync_with_members().unwrap();
        let me = sst.get_local_index();
        for value in 1..=UPDATES {
            sst.write(counter, me, value);
            sst.put_field(counter).unwrap();
        }
        sst.sync_with_members().unwrap();
    });

    let config = SstConfig::new().with_local_id(2).with_peers(peers);
    let ctx = TransportContext::initialize(&config, Arc::new(ShmProvider::new())).unwrap();
    let mut layout = LayoutBuilder::new();
    let counter = layout.field::<u64>();
    let sst = Sst::new(&ctx, layout.finish()).unwrap();

    sst.sync_with_members().unwrap();
    let writer_row = sst.rank_of(1).unwrap();
    let mut last = 0u64;
    while last < UPDATES {
        let seen = sst.read(counter, writer_row);
        assert!(seen >= last, "observed counter went backwards: {} < {}", seen, last);
        last = seen;
    }
    sst.sync_with_members().unwrap();
    writer.join().unwrap();
}

// =============================================================================
// Sync barrier
// =============================================================================

/// Both peers return from sync_with_members only once both have entered it.
#[test]
fn test_sync_barrier_waits_for_both_peers() {
    let peers = peer_table(47511, 2);
    const HOLD: Duration = Duration::from_millis(300);

    let late_peers = peers.clone();
    let late = thread::spawn(move || {
        let config = SstConfig::new().with_local_id(2).with_peers(late_peers);
        let ctx = TransportContext::initialize(&config, Arc::new(ShmProvider::new())).unwrap();
        let mut layout = LayoutBuilder::new();
        let _counter = layout.field::<u64>();
        let sst = Sst::new(&ctx, layout.finish()).unwrap();

        thread::sleep(HOLD);
        sst.sync_with_members().unwrap();
    });

    let config = SstConfig::new().with_local_id(1).with_peers(peers);
    let ctx = TransportContext::initialize(&config, Arc::new(ShmProvider::new())).unwrap();
    let mut layout = LayoutBuilder::new();
    let _counter = layout.field::<u64>();
    let sst = Sst::new(&ctx, layout.finish()).unwrap();

    let entered = Instant::now();
    sst.sync_with_members().unwrap();
    let waited = entered.elapsed();

    assert!(
        waited >= HOLD - Duration::from_millis(50),
        "sync returned after {:?}, before the peer entered it",
        waited
    );
    late.join().unwrap();
}
