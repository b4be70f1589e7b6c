//! Shared session directory
//!
//! Every gateway instance reads and writes session records through the
//! `SessionStore` trait. `create` is an atomic create-if-absent and `update`
//! an atomic read-modify-write; nothing in the gateway performs a plain
//! get-then-set on session records.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

use super::key::ImageKey;
use super::state::Session;

/// Session store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Backend(String),

    #[error("corrupt session record for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("gave up updating {0} after repeated concurrent modification")]
    Contention(String),
}

/// What an update closure wants done with the record it was handed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// Persist the mutated record
    Keep,
    /// Delete the record in the same atomic step
    Remove,
    /// Leave the stored record untouched
    Skip,
}

/// Result of an atomic update
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// No record for the key
    Missing,
    /// The closure returned `Skip`; carries the stored record
    Unchanged(Session),
    /// The mutated record was written
    Updated(Session),
    /// The record was deleted; carries its final state
    Removed(Session),
}

/// Update closure. May run more than once on optimistic backends, so it
/// must only depend on the record it is given.
pub type Mutator<'a> = &'a (dyn Fn(&mut Session) -> Mutation + Send + Sync);

/// Key-value store of session records keyed by image key
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &ImageKey) -> Result<Option<Session>, StoreError>;

    /// Insert `session` unless a record already exists. Returns false if one did.
    async fn create(&self, key: &ImageKey, session: &Session) -> Result<bool, StoreError>;

    async fn update(&self, key: &ImageKey, mutate: Mutator<'_>)
    -> Result<UpdateOutcome, StoreError>;

    async fn delete(&self, key: &ImageKey) -> Result<(), StoreError>;

    async fn list_all(&self) -> Result<Vec<Session>, StoreError>;

    /// Bump `last_access` and refresh any store-level expiry.
    /// Returns false when there is no record.
    async fn touch(&self, key: &ImageKey, now: u64) -> Result<bool, StoreError> {
        let outcome = self
            .update(key, &move |session: &mut Session| {
                if now > session.last_access {
                    session.last_access = now;
                }
                Mutation::Keep
            })
            .await?;
        Ok(!matches!(outcome, UpdateOutcome::Missing))
    }
}

struct Entry {
    session: Session,
    expires_at: Option<Instant>,
}

/// In-process store for single-instance deployments and tests.
///
/// With a TTL, records expire once they have not been written for that long.
pub struct InMemorySessionStore {
    entries: RwLock<HashMap<ImageKey, Entry>>,
    ttl: Option<Duration>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: None,
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    fn expiry(&self) -> Option<Instant> {
        self.ttl.map(|ttl| Instant::now() + ttl)
    }

    fn entry(&self, session: Session) -> Entry {
        Entry {
            session,
            expires_at: self.expiry(),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_live(entry: &Entry, now: Instant) -> bool {
    entry.expires_at.is_none_or(|at| at > now)
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, key: &ImageKey) -> Result<Option<Session>, StoreError> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|e| is_live(e, now))
            .map(|e| e.session.clone()))
    }

    async fn create(&self, key: &ImageKey, session: &Session) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| is_live(e, now)) {
            return Ok(false);
        }
        let entry = self.entry(session.clone());
        entries.insert(key.clone(), entry);
        Ok(true)
    }

    async fn update(
        &self,
        key: &ImageKey,
        mutate: Mutator<'_>,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        let Some(entry) = entries.get(key).filter(|e| is_live(e, now)) else {
            entries.remove(key);
            return Ok(UpdateOutcome::Missing);
        };

        let mut session = entry.session.clone();
        match mutate(&mut session) {
            Mutation::Skip => Ok(UpdateOutcome::Unchanged(entry.session.clone())),
            Mutation::Remove => {
                entries.remove(key);
                Ok(UpdateOutcome::Removed(session))
            }
            Mutation::Keep => {
                let entry = self.entry(session.clone());
                entries.insert(key.clone(), entry);
                Ok(UpdateOutcome::Updated(session))
            }
        }
    }

    async fn delete(&self, key: &ImageKey) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Session>, StoreError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, e| is_live(e, now));
        Ok(entries.values().map(|e| e.session.clone()).collect())
    }
}
