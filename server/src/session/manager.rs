use dashmap::DashMap;
use metrics::{counter, histogram};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::key::ImageKey;
use super::state::{ClientRefId, Overlay, Session, now_millis};
use super::store::{Mutation, SessionStore, UpdateOutcome};
use crate::dataset::DatasetOverlayProvider;
use crate::error::GatewayError;
use crate::shard::{Shard, ShardClient, ShardDirectory, ShardError, SlideDimensions};

/// Upper bound on lookup/create rounds in `ensure_session`
const MAX_ENSURE_ROUNDS: usize = 3;

/// Session manager tuning
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Trust a session without probing its shard if verified this recently
    pub liveness_grace: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            liveness_grace: Duration::from_secs(10),
        }
    }
}

/// Result of releasing one viewer reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The reference was not held (or the session is gone)
    NotHeld,
    /// The reference was dropped; other viewers keep the session open
    Released,
    /// The last reference was dropped and the session torn down
    TornDown,
}

/// Session manager: the only component that mutates session records.
///
/// Talks to the shard directory, the shared store and the shards. Holds no
/// session state itself apart from per-key creation locks, which only
/// serialize handshakes started by this process.
pub struct SessionManager {
    shards: Arc<ShardDirectory>,
    store: Arc<dyn SessionStore>,
    client: Arc<dyn ShardClient>,
    mount_root: PathBuf,
    config: SessionManagerConfig,
    creation_locks: DashMap<ImageKey, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(
        shards: Arc<ShardDirectory>,
        store: Arc<dyn SessionStore>,
        client: Arc<dyn ShardClient>,
        mount_root: impl Into<PathBuf>,
    ) -> Self {
        Self::with_config(
            shards,
            store,
            client,
            mount_root,
            SessionManagerConfig::default(),
        )
    }

    pub fn with_config(
        shards: Arc<ShardDirectory>,
        store: Arc<dyn SessionStore>,
        client: Arc<dyn ShardClient>,
        mount_root: impl Into<PathBuf>,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            shards,
            store,
            client,
            mount_root: mount_root.into(),
            config,
            creation_locks: DashMap::new(),
        }
    }

    pub fn shards(&self) -> &ShardDirectory {
        &self.shards
    }

    pub fn client(&self) -> &Arc<dyn ShardClient> {
        &self.client
    }

    /// Shard that holds `session` open
    pub fn shard_for(&self, session: &Session) -> Result<&Shard, GatewayError> {
        self.shards.by_id(&session.shard_id).ok_or_else(|| {
            GatewayError::SessionInconsistency(format!(
                "{} (shard '{}' is not configured)",
                session.image_key, session.shard_id
            ))
        })
    }

    /// Return the live session for `key` with `client_ref` added to its
    /// references, opening the slide on its shard if needed.
    pub async fn ensure_session(
        &self,
        key: &ImageKey,
        client_ref: &str,
        overlays: &dyn DatasetOverlayProvider,
    ) -> Result<Session, GatewayError> {
        let mut inherited: BTreeSet<ClientRefId> = BTreeSet::new();
        let mut invalidated = false;

        for _ in 0..MAX_ENSURE_ROUNDS {
            if let Some(existing) = self.store.get(key).await? {
                match self.check_alive(&existing).await {
                    Ok(verified_at) => {
                        if let Some(session) = self
                            .attach(key, client_ref, &existing.remote_session_token, verified_at)
                            .await?
                        {
                            counter!("wsigateway_session_reuse_total").increment(1);
                            return Ok(session);
                        }
                        debug!("Session for {} vanished before attach", key);
                    }
                    Err(GatewayError::SessionInconsistency(_)) if !invalidated => {
                        invalidated = true;
                        if let Some(dead) = self.invalidate(&existing).await? {
                            inherited = dead.client_refs;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(session) = self
                .create_or_join(key, client_ref, &inherited, overlays)
                .await?
            {
                return Ok(session);
            }
        }

        Err(GatewayError::SessionInconsistency(key.to_string()))
    }

    /// Drop one viewer reference, tearing the session down with the last one.
    /// Releasing a reference that is not held is a no-op.
    pub async fn release_reference(
        &self,
        key: &ImageKey,
        client_ref: &str,
    ) -> Result<ReleaseOutcome, GatewayError> {
        let outcome = self
            .store
            .update(key, &|session: &mut Session| {
                if !session.remove_ref(client_ref) {
                    Mutation::Skip
                } else if session.has_refs() {
                    Mutation::Keep
                } else {
                    Mutation::Remove
                }
            })
            .await?;

        match outcome {
            UpdateOutcome::Removed(session) => {
                info!("Last reference released for {}, tearing down", key);
                if let Err(e) = self.reset_remote(&session).await {
                    warn!("Remote reset failed for {}: {}", key, e);
                }
                Ok(ReleaseOutcome::TornDown)
            }
            UpdateOutcome::Updated(session) => {
                debug!(
                    "Released {} from {} ({} references left)",
                    client_ref,
                    key,
                    session.client_refs.len()
                );
                Ok(ReleaseOutcome::Released)
            }
            UpdateOutcome::Unchanged(_) | UpdateOutcome::Missing => Ok(ReleaseOutcome::NotHeld),
        }
    }

    pub async fn list_all_sessions(&self) -> Result<Vec<Session>, GatewayError> {
        Ok(self.store.list_all().await?)
    }

    /// Lookup-only access for requests that carry no viewer reference
    pub async fn existing_session(&self, key: &ImageKey) -> Result<Session, GatewayError> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("no open session for {}", key)))
    }

    /// Record tile activity. Returns false when the session no longer exists.
    pub async fn touch(&self, key: &ImageKey) -> Result<bool, GatewayError> {
        Ok(self.store.touch(key, now_millis()).await?)
    }

    /// `PUT /reset/{token}` on the session's shard; leaves the record alone
    pub async fn reset_remote(&self, session: &Session) -> Result<(), GatewayError> {
        let shard = self.shard_for(session)?;
        counter!("wsigateway_remote_resets_total").increment(1);
        self.client
            .reset(shard, &session.remote_session_token)
            .await
            .map_err(|e| GatewayError::upstream(&shard.id, e))
    }

    /// Delete the record of `session` unless it has since been replaced.
    /// Returns true if a record was deleted.
    pub async fn forget(&self, session: &Session) -> Result<bool, GatewayError> {
        let token = session.remote_session_token.as_str();
        let outcome = self
            .store
            .update(&session.image_key, &|current: &mut Session| {
                if current.remote_session_token == token {
                    Mutation::Remove
                } else {
                    Mutation::Skip
                }
            })
            .await?;
        Ok(matches!(outcome, UpdateOutcome::Removed(_)))
    }

    /// Tear down sessions without activity for `max_idle`
    pub async fn reap_idle(&self, max_idle: Duration) -> Result<usize, GatewayError> {
        let max_idle_ms = max_idle.as_millis() as u64;
        let now = now_millis();
        let mut reaped = 0;

        for session in self.store.list_all().await? {
            if session.idle_for(now) < max_idle_ms {
                continue;
            }
            let token = session.remote_session_token.as_str();
            let outcome = self
                .store
                .update(&session.image_key, &|current: &mut Session| {
                    // Re-check under the atomic update: a viewer may have just touched it
                    if current.remote_session_token == token
                        && current.idle_for(now) >= max_idle_ms
                    {
                        Mutation::Remove
                    } else {
                        Mutation::Skip
                    }
                })
                .await?;

            if let UpdateOutcome::Removed(removed) = outcome {
                info!(
                    "Reaping idle session for {} (idle {}s)",
                    removed.image_key,
                    removed.idle_for(now) / 1000
                );
                if let Err(e) = self.reset_remote(&removed).await {
                    warn!("Remote reset failed for {}: {}", removed.image_key, e);
                }
                counter!("wsigateway_sessions_reaped_total").increment(1);
                reaped += 1;
            }
        }

        Ok(reaped)
    }

    /// Liveness check. `Ok(Some(ts))` when the shard just confirmed the token,
    /// `Ok(None)` when the check was skipped as recently verified.
    async fn check_alive(&self, session: &Session) -> Result<Option<u64>, GatewayError> {
        let now = now_millis();
        let grace_ms = self.config.liveness_grace.as_millis() as u64;
        if now.saturating_sub(session.verified_at) < grace_ms {
            return Ok(None);
        }

        let shard = self.shard_for(session)?;
        match self
            .client
            .slide_dimensions(shard, &session.remote_session_token)
            .await
        {
            Ok(_) => Ok(Some(now)),
            Err(ShardError::UnknownSession) => {
                warn!(
                    "Shard {} no longer knows the session for {}",
                    shard.id, session.image_key
                );
                Err(GatewayError::SessionInconsistency(
                    session.image_key.to_string(),
                ))
            }
            Err(e) => Err(GatewayError::upstream(&shard.id, e)),
        }
    }

    /// Add `client_ref` to the stored session. `None` when there is no record.
    async fn attach(
        &self,
        key: &ImageKey,
        client_ref: &str,
        verified_token: &str,
        verified_at: Option<u64>,
    ) -> Result<Option<Session>, GatewayError> {
        let now = now_millis();
        let outcome = self
            .store
            .update(key, &|session: &mut Session| {
                session.add_ref(client_ref);
                session.last_access = session.last_access.max(now);
                if let Some(ts) = verified_at {
                    if session.remote_session_token == verified_token {
                        session.verified_at = ts;
                    }
                }
                Mutation::Keep
            })
            .await?;

        Ok(match outcome {
            UpdateOutcome::Updated(s) | UpdateOutcome::Unchanged(s) => Some(s),
            UpdateOutcome::Removed(_) | UpdateOutcome::Missing => None,
        })
    }

    /// Drop a session whose token the shard has forgotten
    async fn invalidate(&self, dead: &Session) -> Result<Option<Session>, GatewayError> {
        counter!("wsigateway_session_invalidations_total").increment(1);
        let token = dead.remote_session_token.as_str();
        let outcome = self
            .store
            .update(&dead.image_key, &|current: &mut Session| {
                if current.remote_session_token == token {
                    Mutation::Remove
                } else {
                    Mutation::Skip
                }
            })
            .await?;

        match outcome {
            UpdateOutcome::Removed(removed) => {
                // Usually already gone on the shard; clean up in case it is not
                if let Err(e) = self.reset_remote(&removed).await {
                    debug!("Reset of stale token for {} failed: {}", removed.image_key, e);
                }
                Ok(Some(removed))
            }
            _ => Ok(None),
        }
    }

    /// Create path, serialized per key within this process. `None` when the
    /// record that beat us was removed before we could join it.
    async fn create_or_join(
        &self,
        key: &ImageKey,
        client_ref: &str,
        inherited: &BTreeSet<ClientRefId>,
        overlays: &dyn DatasetOverlayProvider,
    ) -> Result<Option<Session>, GatewayError> {
        let lock = self.creation_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(key, client_ref, inherited, overlays)
                .await
        };
        drop(lock);
        self.creation_locks
            .remove_if(key, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn create_locked(
        &self,
        key: &ImageKey,
        client_ref: &str,
        inherited: &BTreeSet<ClientRefId>,
        overlays: &dyn DatasetOverlayProvider,
    ) -> Result<Option<Session>, GatewayError> {
        // Another task of this process may have opened it while we waited
        if let Some(existing) = self.store.get(key).await? {
            return self
                .attach(key, client_ref, &existing.remote_session_token, None)
                .await;
        }

        let start = Instant::now();
        let shard = self.shards.get_shard(key)?.clone();
        let mut session = self.open_remote(&shard, key, overlays).await?;
        session.client_refs = inherited.clone();
        session.add_ref(client_ref);

        match self.store.create(key, &session).await {
            Ok(true) => {
                info!(
                    "Opened session for {} on shard {} with {} overlays",
                    key,
                    shard.id,
                    session.overlays.len()
                );
                counter!("wsigateway_handshakes_total").increment(1);
                histogram!("wsigateway_session_create_duration_seconds")
                    .record(start.elapsed());
                Ok(Some(session))
            }
            Ok(false) => {
                warn!(
                    "Lost session creation race for {}; discarding token on {}",
                    key, shard.id
                );
                counter!("wsigateway_session_races_lost_total").increment(1);
                self.discard_remote(&shard, &session.remote_session_token)
                    .await;
                self.attach(key, client_ref, "", None).await
            }
            Err(e) => {
                self.discard_remote(&shard, &session.remote_session_token)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Handshake, bind the slide and register overlays. On failure the token
    /// is reset and nothing is returned, so no partial session escapes.
    async fn open_remote(
        &self,
        shard: &Shard,
        key: &ImageKey,
        overlays: &dyn DatasetOverlayProvider,
    ) -> Result<Session, GatewayError> {
        let sources = overlays.overlay_sources(key).await?;
        let color_map = overlays.color_map();

        let token = self
            .client
            .open_session(shard)
            .await
            .map_err(|e| GatewayError::upstream(&shard.id, e))?;

        let setup = async {
            let slide_path = key.resolve(&self.mount_root);
            self.client.bind_slide(shard, &token, &slide_path).await?;

            let mut registered = Vec::with_capacity(sources.len());
            for source in &sources {
                let layer_number = self
                    .client
                    .register_overlay(shard, &token, &source.path)
                    .await?;
                registered.push(Overlay {
                    layer_number,
                    kind: source.kind,
                });
            }
            if let Some(ref cmap) = color_map
                && !registered.is_empty()
            {
                self.client.register_color_map(shard, &token, cmap).await?;
            }

            let dims = self.client.slide_dimensions(shard, &token).await?;
            Ok::<(Vec<Overlay>, SlideDimensions), ShardError>((registered, dims))
        };

        match setup.await {
            Ok((overlays, slide_dimensions)) => {
                let now = now_millis();
                Ok(Session {
                    image_key: key.clone(),
                    remote_session_token: token,
                    shard_id: shard.id.clone(),
                    overlays,
                    client_refs: BTreeSet::new(),
                    slide_dimensions,
                    created_at: now,
                    last_access: now,
                    verified_at: now,
                })
            }
            Err(e) => {
                warn!("Session setup for {} on {} failed: {}", key, shard.id, e);
                self.discard_remote(shard, &token).await;
                Err(GatewayError::upstream(&shard.id, e))
            }
        }
    }

    async fn discard_remote(&self, shard: &Shard, token: &str) {
        if let Err(e) = self.client.reset(shard, token).await {
            warn!("Failed to discard token on {}: {}", shard.id, e);
        }
    }

    fn creation_lock(&self, key: &ImageKey) -> Arc<Mutex<()>> {
        let entry = self
            .creation_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }
}
