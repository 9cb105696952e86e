//! # Pocket Sync
//!
//! Async sessions for the Pocket sync protocol, on top of `pocket-engine`.
//!
//! - [`SyncClient`] drives one session: handshake, push, paginated pull,
//!   keepalive and close, over any [`Transport`].
//! - [`Replicator`] glues a client to a local replica and document store,
//!   settling push verdicts with rollback and merging pulled changes.
//! - [`SyncServer`] is the authoritative peer: sessions, push acceptance
//!   and the change log served to pulls.
//!
//! ## Configuration
//!
//! Both ends read their settings from the environment (a `.env` file is
//! honoured). See [`SyncConfig::load`] and [`ServerConfig::load`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use pocket_engine::MemoryStore;
//! use pocket_sync::{
//!     MemoryCheckpointStore, MemoryTransport, Replicator, SyncClient, SyncConfig, SyncServer,
//!     ServerConfig,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> pocket_sync::Result<()> {
//! let server = SyncServer::new_shared(ServerConfig::new("server"));
//! let (client_end, server_end) = MemoryTransport::pair();
//! server.serve(server_end);
//!
//! let config = SyncConfig::new("device_1").with_collections(["todos"]);
//! let replicator = Replicator::new(
//!     SyncClient::new(client_end, config),
//!     MemoryStore::new(),
//!     MemoryCheckpointStore::new(),
//! );
//!
//! replicator.connect().await?;
//! replicator.insert("todos", "t1", json!({"title": "milk"}))?;
//! let report = replicator.sync().await?;
//! assert_eq!(report.push.accepted, 1);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod replicator;
pub mod server;
pub mod transport;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
pub use client::{PullSummary, SessionState, SyncClient, SyncSession};
pub use config::{ConfigError, ServerConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use events::{EventChannel, SessionEvent};
pub use replicator::{PullReport, PushReport, Replicator, SyncReport};
pub use server::{ServerSession, SessionManager, SyncServer};
pub use transport::{MemoryTransport, Transport};

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
