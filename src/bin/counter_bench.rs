//! In-process counter replication benchmark.
//!
//! Spawns N peers as threads in one process. Every peer publishes `updates`
//! counter increments under a running heartbeat worker; a receiver loop on
//! each peer records the counter values it observes from every row and then
//! reports how many updates in the second half of the run it missed.
//!
//! Run with:
//! ```bash
//! cargo run --release --bin counter_bench -- --nodes 3 --updates 100000
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;

use sst::{LayoutBuilder, NodeId, ShmProvider, Sst, SstConfig, TransportContext};

#[derive(Parser, Debug)]
#[command(name = "counter_bench")]
#[command(about = "In-process counter replication benchmark")]
struct Args {
    /// Number of peers
    #[arg(short, long, default_value = "3")]
    nodes: u32,

    /// Counter updates per peer
    #[arg(short, long, default_value = "10000")]
    updates: u64,

    /// First side-channel port; peer i listens on port_base + i - 1
    #[arg(long, default_value = "28000")]
    port_base: u16,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if args.nodes < 1 {
        eprintln!("number of nodes must be at least one");
        process::exit(-1);
    }
    if args.updates < 1 {
        eprintln!("number of updates must be at least one");
        process::exit(-1);
    }

    let peers: BTreeMap<NodeId, SocketAddr> = (1..=args.nodes)
        .map(|id| {
            let addr = format!("127.0.0.1:{}", args.port_base + id as u16 - 1)
                .parse()
                .unwrap();
            (id, addr)
        })
        .collect();

    let started = Instant::now();
    let mut handles = Vec::new();
    for id in 1..=args.nodes {
        let peers = peers.clone();
        let updates = args.updates;
        handles.push(thread::spawn(move || run_peer(id, peers, updates)));
    }

    let mut reports = Vec::new();
    for handle in handles {
        reports.push(handle.join().expect("peer thread panicked"));
    }
    let elapsed = started.elapsed();

    for report in &reports {
        println!("{}", report);
    }
    let total_updates = args.updates * args.nodes as u64;
    println!(
        "{} peers x {} updates in {:.3}s ({:.0} updates/s/peer)",
        args.nodes,
        args.updates,
        elapsed.as_secs_f64(),
        total_updates as f64 / elapsed.as_secs_f64() / args.nodes as f64,
    );
}

fn run_peer(id: NodeId, peers: BTreeMap<NodeId, SocketAddr>, updates: u64) -> String {
    let n = peers.len();
    let config = SstConfig::new().with_local_id(id).with_peers(peers);
    let ctx = TransportContext::initialize(&config, Arc::new(ShmProvider::new())).unwrap();

    let mut layout = LayoutBuilder::new();
    let counter = layout.field::<u64>();
    let heartbeat = layout.field::<u64>();
    let mut sst = Sst::new(&ctx, layout.finish()).unwrap();
    sst.enable_failure_detection(heartbeat, |node| {
        tracing::warn!(node, "peer failed during benchmark");
    })
    .unwrap();

    let me = sst.get_local_index();
    sst.write(counter, me, 0);
    sst.put().unwrap();
    sst.sync_with_members().unwrap();

    // Observed counter values per row, in arrival order.
    let mut observed: Vec<Vec<u64>> = vec![Vec::new(); n];

    thread::scope(|scope| {
        let table = &sst;
        scope.spawn(move || {
            // Start from 1 so a fresh mirror is distinguishable from "no
            // update yet".
            for value in 1..=updates {
                table.write(counter, me, value);
                table.put_field(counter).unwrap();
            }
        });

        let mut last = vec![0u64; n];
        while !last.iter().all(|&value| value >= updates) {
            for row in 0..n {
                let value = sst.read(counter, row);
                if value != last[row] {
                    observed[row].push(value);
                    last[row] = value;
                }
            }
        }
    });

    sst.sync_with_members().unwrap();

    let mut lines = Vec::new();
    for row in 0..n {
        let (missed, intervals) = missed_in_second_half(&observed[row], updates);
        lines.push(format!(
            "node {} row {}: observed {} updates, missed {} across {} intervals",
            id,
            row,
            observed[row].len(),
            missed,
            intervals
        ));
    }
    lines.join("\n")
}

/// Count skipped counter values in the second half of the run: the steady
/// state, past the startup ramp. Returns (missed values, gap intervals).
fn missed_in_second_half(observed: &[u64], updates: u64) -> (u64, u64) {
    let baseline = updates / 2;
    let start = match observed.iter().position(|&value| value > baseline) {
        Some(start) => start,
        None => return (0, 0),
    };

    let mut missed = 0;
    let mut intervals = 0;
    let mut prev = baseline;
    for &value in &observed[start..] {
        if value > prev + 1 {
            missed += value - prev - 1;
            intervals += 1;
        }
        prev = value;
    }
    (missed, intervals)
}
