use crate::backend::{CounterEntry, CounterStore, Increment};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use actix_web::rt::task::JoinHandle;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;

/// A [CounterStore] that keeps counters in a process-local [DashMap].
///
/// Counts are not shared between instances; run several instances behind a load balancer and
/// each one enforces its own copy of the quota.
///
/// Expired windows are removed by a sweeper task that must be started explicitly with
/// [InMemoryStore::start_sweeper]. It is stopped by [InMemoryStore::stop_sweeper], or when the
/// store is dropped.
pub struct InMemoryStore {
    map: Arc<DashMap<String, CounterEntry>>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryStore {
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
            clock: Arc::new(SystemClock),
        }
    }

    /// Spawn the sweeper onto the current actix runtime.
    ///
    /// Restarts the task if it is already running.
    pub fn start_sweeper(&self) {
        let handle = Self::sweeper(self.map.clone(), self.clock.clone(), self.sweep_interval);
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        log::debug!(
            "In-memory rate limit sweeper started, interval {:?}",
            self.sweep_interval
        );
    }

    /// Abort the sweeper task, if running. Counters are left in place.
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            log::debug!("In-memory rate limit sweeper stopped");
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Number of buckets currently held, expired or not.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn sweeper(
        map: Arc<DashMap<String, CounterEntry>>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "Sweep interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                actix_web::rt::time::sleep(interval).await;
                let before = map.len();
                sweep(&map, clock.now_ms());
                log::trace!(
                    "Swept {} expired rate limit buckets",
                    before.saturating_sub(map.len())
                );
            }
        })
    }
}

fn sweep(map: &DashMap<String, CounterEntry>, now_ms: u64) {
    map.retain(|_k, v| !v.is_expired(now_ms));
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CounterEntry>> {
        Ok(self.map.get(key).map(|v| *v))
    }

    async fn set(&self, key: &str, entry: CounterEntry) -> Result<()> {
        self.map.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn insert_if_vacant(
        &self,
        key: &str,
        entry: CounterEntry,
        now_ms: u64,
    ) -> Result<CounterEntry> {
        // The entry guard holds the shard lock, so only one caller replaces an expired window.
        let mut slot = self.map.entry(key.to_owned()).or_insert(entry);
        if slot.is_expired(now_ms) {
            *slot = entry;
        }
        Ok(*slot)
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        Ok(self
            .map
            .get_mut(key)
            .map(|mut v| {
                v.count += 1;
                v.count
            })
            .unwrap_or(0))
    }

    async fn increment_within(&self, key: &str, limit: u64) -> Result<Increment> {
        Ok(match self.map.get_mut(key) {
            None => Increment::Missing,
            Some(v) if v.count >= limit => Increment::Full,
            Some(mut v) => {
                v.count += 1;
                Increment::Counted(v.count)
            }
        })
    }

    async fn cleanup(&self) -> Result<()> {
        sweep(&self.map, self.clock.now_ms());
        Ok(())
    }
}

impl Drop for InMemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

pub struct InMemoryStoreBuilder {
    sweep_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryStoreBuilder {
    /// Override the default sweep interval.
    ///
    /// The sweeper periodically scans the internal map, removing expired windows.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// The clock used to decide whether a window has expired. Share it with the limiter.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> InMemoryStore {
        InMemoryStore {
            map: Arc::new(DashMap::new()),
            clock: self.clock,
            sweep_interval: self.sweep_interval,
            sweeper: Mutex::new(None),
        }
    }
}
