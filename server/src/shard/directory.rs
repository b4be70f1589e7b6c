//! Deterministic image-key to shard routing
//!
//! Uses rendezvous (highest-random-weight) hashing: every shard scores the
//! key and the highest score wins. The mapping only depends on the key and
//! the configured shard ids, so every gateway instance with the same pool
//! agrees on the owner, and removing a shard only remaps the keys it owned.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::types::{Shard, ShardId};
use crate::error::GatewayError;
use crate::session::ImageKey;

/// Static pool of backend tile-rendering services
#[derive(Debug, Clone)]
pub struct ShardDirectory {
    shards: Vec<Shard>,
    by_id: HashMap<ShardId, usize>,
}

impl ShardDirectory {
    /// Build a directory from the configured pool.
    ///
    /// Duplicate ids are rejected since they would make routing ambiguous.
    pub fn new(shards: Vec<Shard>) -> Result<Self, GatewayError> {
        let mut by_id = HashMap::with_capacity(shards.len());
        for (idx, shard) in shards.iter().enumerate() {
            if by_id.insert(shard.id.clone(), idx).is_some() {
                return Err(GatewayError::Configuration(format!(
                    "duplicate shard id '{}'",
                    shard.id
                )));
            }
        }
        Ok(Self { shards, by_id })
    }

    /// Shard that owns `key`
    pub fn get_shard(&self, key: &ImageKey) -> Result<&Shard, GatewayError> {
        self.shards
            .iter()
            .max_by(|a, b| {
                score(&a.id, key.as_str())
                    .cmp(&score(&b.id, key.as_str()))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .ok_or_else(|| GatewayError::Configuration("no tile shards configured".to_string()))
    }

    /// Look up a shard by id (used for sessions recorded by any instance)
    pub fn by_id(&self, id: &str) -> Option<&Shard> {
        self.by_id.get(id).map(|&idx| &self.shards[idx])
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

fn score(shard_id: &str, key: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(shard_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> ShardDirectory {
        let shards = (0..n)
            .map(|i| Shard::new(format!("shard-{}", i), format!("http://tiles-{}:5000", i)))
            .collect();
        ShardDirectory::new(shards).unwrap()
    }

    fn key(name: &str) -> ImageKey {
        ImageKey::parse(name).unwrap()
    }

    #[test]
    fn test_same_key_same_shard() {
        let dir = pool(5);
        for i in 0..200 {
            let k = key(&format!("tcga/sample-{}/slide.svs", i));
            let first = dir.get_shard(&k).unwrap().id.clone();
            for _ in 0..3 {
                assert_eq!(dir.get_shard(&k).unwrap().id, first);
            }
        }
    }

    #[test]
    fn test_independent_directories_agree() {
        // Two gateway instances built from the same configuration
        let a = pool(4);
        let b = pool(4);
        for i in 0..100 {
            let k = key(&format!("slide-{}.svs", i));
            assert_eq!(a.get_shard(&k).unwrap(), b.get_shard(&k).unwrap());
        }
    }

    #[test]
    fn test_distribution_is_roughly_even() {
        let dir = pool(4);
        let mut counts: HashMap<String, usize> = HashMap::new();
        let total = 4000;
        for i in 0..total {
            let k = key(&format!("project/{}/image-{}.ndpi", i % 37, i));
            *counts.entry(dir.get_shard(&k).unwrap().id.clone()).or_default() += 1;
        }
        assert_eq!(counts.len(), 4, "every shard should receive keys");
        for (id, count) in counts {
            // Expected 1000 per shard
            assert!(
                (700..=1300).contains(&count),
                "shard {} got {} of {} keys",
                id,
                count,
                total
            );
        }
    }

    #[test]
    fn test_removing_a_shard_only_moves_its_keys() {
        let before = pool(4);
        let after = ShardDirectory::new(before.shards()[..3].to_vec()).unwrap();
        for i in 0..500 {
            let k = key(&format!("slide-{}.svs", i));
            let old = before.get_shard(&k).unwrap();
            if old.id != "shard-3" {
                assert_eq!(after.get_shard(&k).unwrap().id, old.id);
            }
        }
    }

    #[test]
    fn test_empty_pool_is_configuration_error() {
        let dir = ShardDirectory::new(Vec::new()).unwrap();
        let result = dir.get_shard(&key("slideA.svs"));
        assert!(matches!(result, Err(GatewayError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let shards = vec![
            Shard::new("a", "http://one:5000"),
            Shard::new("a", "http://two:5000"),
        ];
        assert!(ShardDirectory::new(shards).is_err());
    }

    #[test]
    fn test_lookup_by_id() {
        let dir = pool(3);
        assert_eq!(dir.by_id("shard-1").unwrap().base_url, "http://tiles-1:5000");
        assert!(dir.by_id("shard-9").is_none());
    }
}
