//! Read-through cache over ban status
//!
//! Keeps ban lookups off the hot admission path. Entries live for a short
//! TTL and the map is capacity-bounded with oldest-entry eviction. Any ban
//! write must call [`BanCache::invalidate`] so the new status is visible to
//! this process immediately rather than after TTL expiry.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::db::{with_retry, Database};

#[derive(Debug, Clone, Copy)]
struct CachedStatus {
    banned: bool,
    cached_at: Instant,
}

#[derive(Debug)]
pub struct BanCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, CachedStatus>>,
}

impl BanCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the identity is currently banned.
    ///
    /// Serves from cache within the TTL, otherwise reads through to the
    /// store with retries. If the store stays unreachable the check fails
    /// open: the identity is treated as not banned and nothing is cached.
    pub async fn is_banned(&self, db: &Database, identity_hash: &str) -> bool {
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(identity_hash) {
                if entry.cached_at.elapsed() < self.ttl {
                    return entry.banned;
                }
            }
        }

        let status = with_retry("get_ban_status", || db.get_ban_status(identity_hash)).await;

        let banned = match status {
            Ok(record) => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_secs() as i64;
                record.map(|r| r.is_banned(now)).unwrap_or(false)
            }
            Err(err) => {
                warn!(identity = %identity_hash, "ban check failing open: {err:#}");
                return false;
            }
        };

        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity && !entries.contains_key(identity_hash) {
            // Evict the stalest entry to stay bounded
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, v)| v.cached_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            identity_hash.to_string(),
            CachedStatus {
                banned,
                cached_at: Instant::now(),
            },
        );

        banned
    }

    /// Drop the cached status for an identity. Must follow every ban write.
    pub async fn invalidate(&self, identity_hash: &str) {
        self.entries.lock().await.remove(identity_hash);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
