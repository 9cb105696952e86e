//! # Pocket Engine
//!
//! The deterministic core of Pocket's offline-first synchronization.
//!
//! This crate holds everything two replicas need to agree on shared data
//! without talking to each other in real time: causality tracking, the
//! last-writer-wins merge rule, change logs and checkpoints, optimistic
//! updates with rollback, selective-sync filters and the wire protocol
//! message types. The async session layer lives in `pocket-sync`.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, sockets or the system clock
//! - **Deterministic**: wall-clock time is always passed in by the caller
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Clocks
//!
//! - [`VectorClock`] detects whether two writes are ordered or concurrent.
//! - [`LamportClock`] produces the totally ordered stamps used by the merge.
//! - [`HybridLogicalClock`] keeps stamps close to physical time.
//!
//! ### Merge
//!
//! [`LwwMap`] is a last-writer-wins map with tombstones. Equal Lamport
//! counters are settled by [`TieBreak`], so merges are commutative,
//! associative and idempotent. A [`Replica`] keeps one map per collection
//! and turns local writes into [`ChangeRecord`]s.
//!
//! ### Optimistic updates
//!
//! [`OptimisticTracker`] applies local writes to a [`DocumentStore`] right
//! away and remembers their pre-images; [`RollbackManager`] reverts them
//! newest-first when the peer refuses.
//!
//! ## Quick Start
//!
//! ```rust
//! use pocket_engine::{MemoryStore, OptimisticTracker, Replica, RollbackManager};
//! use serde_json::json;
//!
//! let mut replica = Replica::new("device_1");
//! let mut store = MemoryStore::new();
//! let mut tracker = OptimisticTracker::new();
//!
//! let change = replica
//!     .insert("todos", "t1", json!({"title": "milk"}), 1706745600000)
//!     .unwrap();
//! let update = tracker.apply(&mut store, change, 1706745600000).unwrap();
//!
//! // The server refused it.
//! let result = RollbackManager::new(&mut tracker, &mut store).rollback(&update);
//! assert_eq!(result.succeeded(), 1);
//! ```

pub mod change;
pub mod clock;
pub mod crdt;
pub mod error;
pub mod filter;
pub mod hlc;
pub mod optimistic;
pub mod protocol;
pub mod replica;
pub mod rollback;
pub mod snapshot;
pub mod store;
pub mod vector_clock;

// Re-export main types at crate root
pub use change::{
    decode_checkpoint, encode_checkpoint, ChangeId, ChangeLog, ChangeOperation, ChangeRecord,
    LogPage,
};
pub use clock::{LamportClock, LamportTimestamp};
pub use crdt::{ConflictResolution, LwwEntry, LwwMap, MergeOutcome, TieBreak, Winner};
pub use error::Error;
pub use filter::{FilterDecision, FilterOperator, SelectiveSync, SyncFilter, SyncFilterRule};
pub use hlc::{HlcTimestamp, HybridLogicalClock};
pub use optimistic::{OptimisticTracker, OptimisticUpdate, SyncState, TrackerStats, UpdateId};
pub use protocol::{
    error_code_for, AcceptedChange, Capabilities, Envelope, ErrorCode, ErrorPayload,
    HandshakeAckPayload, HandshakePayload, Message, PullPayload, PullResponsePayload,
    PushAckPayload, PushPayload, RejectedChange, PROTOCOL_NAME, PROTOCOL_VERSION,
};
pub use replica::{RemoteApply, Replica};
pub use rollback::{RollbackError, RollbackManager, RollbackResult};
pub use snapshot::{ReplicaSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{DocumentStore, MemoryCollection, MemoryStore};
pub use vector_clock::VectorClock;

/// Type aliases for clarity
pub type NodeId = String;
pub type CollectionName = String;
pub type DocumentId = String;
pub type Timestamp = u64;
pub type Checkpoint = String;
