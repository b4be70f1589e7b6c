//! Operator-triggered teardown of every open session

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::session::{Session, SessionManager};
use crate::shard::ShardId;

/// Outcome of a bulk reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    /// Sessions found in the store
    pub attempted: usize,
    /// Remote resets (or record deletions) that failed
    pub failed: usize,
}

pub struct BulkResetCoordinator {
    sessions: Arc<SessionManager>,
}

impl BulkResetCoordinator {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Reset every listed session on its shard, then drop all the records.
    ///
    /// Shards are reset concurrently, sessions on one shard in sequence.
    /// Records are deleted whether or not their remote reset succeeded.
    pub async fn reset_all(&self) -> Result<ResetReport, GatewayError> {
        let listed = self.sessions.list_all_sessions().await?;
        let attempted = listed.len();
        info!("Bulk reset of {} sessions", attempted);

        let mut by_shard: BTreeMap<ShardId, Vec<Session>> = BTreeMap::new();
        for session in listed {
            by_shard
                .entry(session.shard_id.clone())
                .or_default()
                .push(session);
        }

        let batches = join_all(
            by_shard
                .into_iter()
                .map(|(shard_id, batch)| self.reset_shard(shard_id, batch)),
        )
        .await;

        let mut failed = 0;
        for (batch, batch_failed) in batches {
            failed += batch_failed;
            for session in batch {
                if let Err(e) = self.sessions.forget(&session).await {
                    warn!(
                        "Failed to delete session record for {}: {}",
                        session.image_key, e
                    );
                    failed += 1;
                }
            }
        }

        info!("Bulk reset finished: {} attempted, {} failed", attempted, failed);
        Ok(ResetReport { attempted, failed })
    }

    async fn reset_shard(&self, shard_id: ShardId, batch: Vec<Session>) -> (Vec<Session>, usize) {
        let mut failed = 0;
        for session in &batch {
            if let Err(e) = self.sessions.reset_remote(session).await {
                warn!(
                    "Reset of {} on shard {} failed: {}",
                    session.image_key, shard_id, e
                );
                failed += 1;
            }
        }
        (batch, failed)
    }
}
