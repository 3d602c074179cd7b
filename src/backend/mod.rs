pub mod memory;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The state of a single fixed window bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterEntry {
    /// Requests admitted so far in this window.
    pub count: u64,
    /// Time at which the window closes, in milliseconds since the Unix epoch.
    pub reset_at: u64,
}

impl CounterEntry {
    /// A fresh window with no requests counted yet.
    pub fn open(now_ms: u64, window_ms: u64) -> Self {
        Self {
            count: 0,
            reset_at: now_ms.saturating_add(window_ms),
        }
    }

    /// Whether the window has closed at the given time.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.reset_at <= now_ms
    }
}

/// Outcome of [CounterStore::increment_within].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Increment {
    /// The request was counted; holds the new count.
    Counted(u64),
    /// The window is already at its limit and was left untouched.
    Full,
    /// No window exists for the key.
    Missing,
}

/// Describes where rate limit counters live.
///
/// Implementations must make [CounterStore::increment] atomic per key: a read followed by a
/// separate write loses updates under concurrency, which under-counts and lets more traffic
/// through than the policy permits.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Fetch the entry for a key, if one exists.
    ///
    /// Entries that cannot be decoded are reported as absent.
    async fn get(&self, key: &str) -> Result<Option<CounterEntry>>;

    /// Store an entry, replacing whatever was there.
    async fn set(&self, key: &str, entry: CounterEntry) -> Result<()>;

    /// Store `entry` unless a live (unexpired) entry already exists, returning the live entry.
    ///
    /// Two requests that both see an expired window will agree on a single replacement. The
    /// default is not atomic; both bundled stores override it.
    async fn insert_if_vacant(
        &self,
        key: &str,
        entry: CounterEntry,
        now_ms: u64,
    ) -> Result<CounterEntry> {
        match self.get(key).await? {
            Some(existing) if !existing.is_expired(now_ms) => Ok(existing),
            _ => {
                self.set(key, entry).await?;
                Ok(entry)
            }
        }
    }

    /// Atomically add one to the count for a key, returning the new count.
    ///
    /// Returns 0 if the key does not exist; a window must be opened before it is counted.
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Add one to the count for a key only while it is below `limit`.
    ///
    /// This keeps a window's count within `[0, limit]` however many requests race for the last
    /// slot. The default is not atomic; both bundled stores override it.
    async fn increment_within(&self, key: &str, limit: u64) -> Result<Increment> {
        match self.get(key).await? {
            None => Ok(Increment::Missing),
            Some(entry) if entry.count >= limit => Ok(Increment::Full),
            Some(_) => match self.increment(key).await? {
                0 => Ok(Increment::Missing),
                count => Ok(Increment::Counted(count)),
            },
        }
    }

    /// Remove expired entries. Stores with native expiry do nothing.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry_boundary() {
        let entry = CounterEntry::open(1_000, 500);
        assert_eq!(entry.count, 0);
        assert_eq!(entry.reset_at, 1_500);
        assert!(!entry.is_expired(1_499));
        assert!(entry.is_expired(1_500));
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = CounterEntry {
            count: 3,
            reset_at: 42,
        };
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"count":3,"resetAt":42}"#
        );
    }
}
