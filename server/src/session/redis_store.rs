//! Redis-backed session store for multi-instance deployments
//!
//! Records are JSON documents under `wsigateway:session:<image key>`.
//! Create is `SET NX PX`; update is an optimistic loop around a Lua
//! compare-and-swap on the serialized record, so two gateways racing on the
//! same key never both win.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, warn};

use super::key::ImageKey;
use super::state::Session;
use super::store::{Mutation, Mutator, SessionStore, StoreError, UpdateOutcome};

const KEY_PREFIX: &str = "wsigateway:session:";

/// Attempts before an update reports `StoreError::Contention`
const MAX_CAS_ATTEMPTS: usize = 16;

/// Replace (or delete, when the new value is empty) only if unchanged
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current ~= ARGV[1] then
  return 0
end
if ARGV[2] == '' then
  redis.call('DEL', KEYS[1])
else
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
end
return 1
"#;

pub struct RedisSessionStore {
    conn: ConnectionManager,
    ttl: Duration,
    cas: redis::Script,
}

impl RedisSessionStore {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client.get_connection_manager().await.map_err(backend)?;
        Ok(Self {
            conn,
            ttl,
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }

    fn ttl_millis(&self) -> u64 {
        self.ttl.as_millis().max(1) as u64
    }

    async fn get_raw(&self, redis_key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(redis_key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(raw)
    }

    /// Swap `expected` for `replacement` (empty deletes). False on conflict.
    async fn compare_and_swap(
        &self,
        redis_key: &str,
        expected: &str,
        replacement: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas
            .key(redis_key)
            .arg(expected)
            .arg(replacement)
            .arg(self.ttl_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(swapped == 1)
    }
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn redis_key(key: &ImageKey) -> String {
    format!("{}{}", KEY_PREFIX, key.as_str())
}

fn decode(redis_key: &str, raw: &str) -> Result<Session, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: redis_key.to_string(),
        reason: e.to_string(),
    })
}

fn encode(session: &Session) -> Result<String, StoreError> {
    serde_json::to_string(session).map_err(|e| StoreError::Corrupt {
        key: session.image_key.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, key: &ImageKey) -> Result<Option<Session>, StoreError> {
        let rk = redis_key(key);
        match self.get_raw(&rk).await? {
            Some(raw) => decode(&rk, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn create(&self, key: &ImageKey, session: &Session) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(redis_key(key))
            .arg(encode(session)?)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_millis())
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn update(
        &self,
        key: &ImageKey,
        mutate: Mutator<'_>,
    ) -> Result<UpdateOutcome, StoreError> {
        let rk = redis_key(key);
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let Some(raw) = self.get_raw(&rk).await? else {
                return Ok(UpdateOutcome::Missing);
            };
            let current = decode(&rk, &raw)?;
            let mut next = current.clone();

            let (replacement, outcome) = match mutate(&mut next) {
                Mutation::Skip => return Ok(UpdateOutcome::Unchanged(current)),
                Mutation::Remove => (String::new(), UpdateOutcome::Removed(next)),
                Mutation::Keep => (encode(&next)?, UpdateOutcome::Updated(next)),
            };

            if self.compare_and_swap(&rk, &raw, &replacement).await? {
                return Ok(outcome);
            }
            debug!("CAS conflict on {} (attempt {})", rk, attempt + 1);
        }
        warn!("Giving up on {} after {} CAS attempts", rk, MAX_CAS_ATTEMPTS);
        Err(StoreError::Contention(key.to_string()))
    }

    async fn delete(&self, key: &ImageKey) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(redis_key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Session>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", KEY_PREFIX);
        let mut cursor: u64 = 0;
        let mut keys: Vec<String> = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();

        let mut sessions = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(100) {
            let values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(chunk)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            for (rk, raw) in chunk.iter().zip(values) {
                // Deleted between SCAN and MGET
                let Some(raw) = raw else { continue };
                match decode(rk, &raw) {
                    Ok(session) => sessions.push(session),
                    Err(e) => warn!("Skipping unreadable session record: {}", e),
                }
            }
        }
        Ok(sessions)
    }
}
