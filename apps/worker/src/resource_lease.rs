//! Keyed leases over media items, separate from job leases.
//!
//! Only one transcode per media id may run at a time. A lease older than
//! the configured timeout is treated as abandoned and can be taken over;
//! the abandoned holder's guard then no longer releases anything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct LeaseEntry {
    owner: i64,
    acquired_at: Instant,
    token: u64,
}

/// Another job holds a live lease on the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("resource is leased by job {owner}")]
pub struct LeaseHeld {
    pub owner: i64,
}

#[derive(Debug, Clone)]
pub struct ResourceLeases {
    entries: Arc<DashMap<String, LeaseEntry>>,
    tokens: Arc<AtomicU64>,
    /// `None` means leases never go stale
    stale_after: Option<Duration>,
}

impl ResourceLeases {
    pub fn new(stale_after: Option<Duration>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            tokens: Arc::new(AtomicU64::new(1)),
            stale_after: stale_after.filter(|d| !d.is_zero()),
        }
    }

    fn is_stale(&self, entry: &LeaseEntry) -> bool {
        self.stale_after
            .is_some_and(|timeout| entry.acquired_at.elapsed() >= timeout)
    }

    /// Lease `key` for job `owner`, taking over a stale lease if necessary
    pub fn try_acquire(&self, key: &str, owner: i64) -> Result<ResourceLease, LeaseHeld> {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let fresh = LeaseEntry {
            owner,
            acquired_at: Instant::now(),
            token,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = *occupied.get();
                if !self.is_stale(&current) {
                    return Err(LeaseHeld {
                        owner: current.owner,
                    });
                }
                tracing::warn!(
                    resource = key,
                    previous_owner = current.owner,
                    new_owner = owner,
                    "Reclaiming stale resource lease"
                );
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }

        Ok(ResourceLease {
            entries: Arc::clone(&self.entries),
            key: key.to_string(),
            owner,
            token,
        })
    }

    /// Job currently holding a live lease on `key`
    pub fn holder(&self, key: &str) -> Option<i64> {
        self.entries
            .get(key)
            .filter(|entry| !self.is_stale(entry))
            .map(|entry| entry.owner)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Held lease; released on drop
#[derive(Debug)]
pub struct ResourceLease {
    entries: Arc<DashMap<String, LeaseEntry>>,
    key: String,
    owner: i64,
    token: u64,
}

impl ResourceLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> i64 {
        self.owner
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        let token = self.token;
        self.entries
            .remove_if(&self.key, |_, entry| entry.token == token);
    }
}
