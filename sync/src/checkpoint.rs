//! Checkpoint persistence.
//!
//! A pull loop saves the checkpoint returned by every page before asking
//! for the next one, so a crash mid-pull resumes where it stopped.

use async_trait::async_trait;
use dashmap::DashMap;
use pocket_engine::Checkpoint;

use crate::error::Result;

/// Durable storage for pull checkpoints, keyed by peer.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, peer: &str) -> Result<Option<Checkpoint>>;

    async fn save(&self, peer: &str, checkpoint: Checkpoint) -> Result<()>;
}

/// Checkpoints kept in memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<String, Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &str) -> Option<Checkpoint> {
        self.checkpoints.get(peer).map(|c| c.value().clone())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, peer: &str) -> Result<Option<Checkpoint>> {
        Ok(self.get(peer))
    }

    async fn save(&self, peer: &str, checkpoint: Checkpoint) -> Result<()> {
        tracing::trace!(peer = %peer, checkpoint = %checkpoint, "checkpoint saved");
        self.checkpoints.insert(peer.to_string(), checkpoint);
        Ok(())
    }
}
