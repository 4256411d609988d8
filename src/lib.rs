//! # sst - Shared State Table replication substrate
//!
//! This crate implements the replication core of Derecho (TOCS 2019) in
//! Rust: a shared state table mirrored across a group of peers with
//! one-sided remote memory writes, plus the reply-tracking machinery of the
//! RPC layer built on top of it.
//!
//! ## Features
//!
//! - **One-sided replication**: each peer owns one row and publishes it to
//!   every mirror with remote writes; no receiver CPU involvement
//! - **Typed rows**: fields are declared once, with deterministic offsets
//!   agreed across peers
//! - **Predicates**: boolean triggers over the table fire registered
//!   actions on a dedicated scan worker
//! - **Failure detection**: a heartbeat field plus a liveness window
//!   classify silent peers as failed and drive per-peer RPC exceptions
//! - **Reply tracking**: one single-assignment slot per contacted peer;
//!   membership losses resolve outstanding slots with per-peer errors
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use sst::{LayoutBuilder, ShmProvider, Sst, SstConfig, TransportContext};
//!
//! let config = SstConfig::new()
//!     .with_local_id(1)
//!     .with_peer(1, "10.0.0.1:37001".parse()?)
//!     .with_peer(2, "10.0.0.2:37001".parse()?);
//! let ctx = TransportContext::initialize(&config, Arc::new(ShmProvider::new()))?;
//!
//! let mut layout = LayoutBuilder::new();
//! let counter = layout.field::<u64>();
//! let heartbeat = layout.field::<u64>();
//! let mut sst = Sst::new(&ctx, layout.finish())?;
//! sst.enable_failure_detection(heartbeat, |node| eprintln!("node {} failed", node))?;
//!
//! let me = sst.get_local_index();
//! sst.write(counter, me, 100);
//! sst.put_field(counter)?;
//! sst.sync_with_members()?;
//! ```
//!
//! ## Architecture
//!
//! The crate is organized as follows:
//!
//! - [`config`]: Configuration (`SstConfig`)
//! - [`transport`]: Provider seam and process-wide state
//!   (`Provider`, `TransportContext`)
//! - [`shmem`]: Bundled process-local provider (`ShmProvider`)
//! - [`connection`]: Connection registry (`Connection`, `ConnectionManager`)
//! - [`memory_region`]: Registered region pairs (`MemoryRegion`)
//! - [`table`]: The table itself (`Sst`, `SstTable`, `LayoutBuilder`)
//! - [`predicates`]: Predicate registry and scan worker (`Predicates`)
//! - [`header`]: RPC header framing (`Opcode`, `populate_header`)
//! - [`replies`]: Reply tracking (`PendingResults`, `QueryResults`)
//!
//! ## References
//!
//! - [Derecho: Fast State Machine Replication for Cloud Services (TOCS 2019)](https://dl.acm.org/doi/10.1145/3302258)

#![allow(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod connection;
pub mod error;
pub mod header;
pub mod memory_region;
pub mod predicates;
pub mod replies;
pub mod shmem;
pub mod table;
pub mod transport;

/// Identifier of a participating process, unique within a deployment.
pub type NodeId = u32;

// Re-export main types
pub use config::SstConfig;
pub use connection::{Connection, ConnectionManager};
pub use error::{Error, Result};
pub use header::{header_space, populate_header, retrieve_header, Opcode, RpcMessage};
pub use memory_region::{MemoryRegion, MrExchangeRecord, MR_EXCHANGE_RECORD_SIZE};
pub use predicates::{PredicateHandle, PredicateKind, Predicates};
pub use replies::{
    PendingBase, PendingRegistry, PendingResults, PendingVoid, QueryResults, QueryVoid, ReplyMap,
};
pub use shmem::ShmProvider;
pub use table::{Field, FieldValue, LayoutBuilder, RowLayout, Sst, SstTable, VectorField};
pub use transport::{
    AccessFlags, Provider, ProviderEndpoint, RegisteredMemory, TransportContext,
};
