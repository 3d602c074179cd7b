use crate::backend::{CounterEntry, CounterStore, Increment};
use crate::error::{Error, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult, Script};
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT_MILLIS: u64 = 500;

/// Minimum time between connection attempts while Redis is unreachable.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

const COUNT_FIELD: &str = "count";
const RESET_AT_FIELD: &str = "reset_at";

// Anything that is not a hash is left over from something else and reads as absent.
static GET: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('TYPE', KEYS[1]).ok ~= 'hash' then
  return {}
end
return redis.call('HMGET', KEYS[1], 'count', 'reset_at')
",
    )
});

// ARGV: count, reset_at (epoch ms), now (epoch ms)
static INSERT_IF_VACANT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local key = KEYS[1]
if redis.call('TYPE', key).ok == 'hash' then
  local current = redis.call('HMGET', key, 'count', 'reset_at')
  local count = tonumber(current[1])
  local reset_at = tonumber(current[2])
  if count and reset_at and reset_at > tonumber(ARGV[3]) then
    return {count, reset_at}
  end
end
redis.call('DEL', key)
redis.call('HSET', key, 'count', ARGV[1], 'reset_at', ARGV[2])
redis.call('PEXPIREAT', key, ARGV[2])
return {tonumber(ARGV[1]), tonumber(ARGV[2])}
",
    )
});

// ARGV: limit. Returns the new count, 0 when there is no window, -1 when it is full.
static INCREMENT_WITHIN: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('TYPE', KEYS[1]).ok ~= 'hash' or redis.call('HEXISTS', KEYS[1], 'reset_at') == 0 then
  return 0
end
local count = tonumber(redis.call('HGET', KEYS[1], 'count')) or 0
if count >= tonumber(ARGV[1]) then
  return -1
end
return redis.call('HINCRBY', KEYS[1], 'count', 1)
",
    )
});

// Never creates the key: a bucket without a window would have no expiry.
static INCREMENT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('TYPE', KEYS[1]).ok ~= 'hash' or redis.call('HEXISTS', KEYS[1], 'reset_at') == 0 then
  return 0
end
return redis.call('HINCRBY', KEYS[1], 'count', 1)
",
    )
});

/// A [CounterStore] that keeps counters in Redis, shared by every instance pointing at it.
///
/// Each window is a hash holding `count` and `reset_at`, set to expire at `reset_at`, so Redis
/// removes closed windows by itself. Increments and window creation each run as a single Lua
/// script.
///
/// A store made with [RedisStore::connect] does not need Redis to be up. Until a connection is
/// made every call returns an error (so the limiter fails open), and a new attempt is made at
/// most once per [RECONNECT_INTERVAL].
#[derive(Clone)]
pub struct RedisStore {
    client: Option<Client>,
    link: Arc<Mutex<Link>>,
    key_prefix: Option<String>,
    timeout: Duration,
}

#[derive(Default)]
struct Link {
    connection: Option<ConnectionManager>,
    last_attempt: Option<Instant>,
}

impl RedisStore {
    /// Create a Builder from an established connection.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_endpoint_rate_limit::backend::redis::RedisStore;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let store = RedisStore::builder(manager).key_prefix(Some("rate-limit:")).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            client: None,
            link: Link {
                connection: Some(connection),
                last_attempt: None,
            },
            key_prefix: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MILLIS),
        }
    }

    /// Create a Builder for `url`, trying a first connection within `timeout`.
    ///
    /// Only an invalid URL is an error. If Redis cannot be reached the failure is logged and the
    /// store keeps retrying as it is used.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Builder> {
        let client = Client::open(url)?;
        let attempt = actix_web::rt::time::timeout(timeout, ConnectionManager::new(client.clone()));
        let connection = match attempt.await {
            Ok(Ok(connection)) => Some(connection),
            Ok(Err(e)) => {
                log::error!("Failed to connect to Redis, will retry on use: {e}");
                None
            }
            Err(_) => {
                log::error!("Redis did not answer within {timeout:?}, will retry on use");
                None
            }
        };
        Ok(Builder {
            client: Some(client),
            link: Link {
                last_attempt: connection.is_none().then(Instant::now),
                connection,
            },
            key_prefix: None,
            timeout,
        })
    }

    fn make_key<'t>(&self, key: &'t str) -> Cow<'t, str> {
        match &self.key_prefix {
            None => Cow::Borrowed(key),
            Some(prefix) => Cow::Owned(format!("{prefix}{key}")),
        }
    }

    async fn bounded<T>(&self, operation: impl Future<Output = RedisResult<T>>) -> Result<T> {
        let result = actix_web::rt::time::timeout(self.timeout, operation)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?;
        Ok(result?)
    }

    /// The live connection, connecting first if there is none yet.
    async fn connection(&self) -> Result<ConnectionManager> {
        let existing = self.link.lock().connection.clone();
        if let Some(connection) = existing {
            return Ok(connection);
        }
        let client = self.client.clone().ok_or(Error::Disconnected)?;
        {
            let mut link = self.link.lock();
            if link
                .last_attempt
                .map_or(false, |at| at.elapsed() < RECONNECT_INTERVAL)
            {
                return Err(Error::Disconnected);
            }
            link.last_attempt = Some(Instant::now());
        }
        match self.bounded(ConnectionManager::new(client)).await {
            Ok(connection) => {
                log::info!("Connected to Redis");
                self.link.lock().connection = Some(connection.clone());
                Ok(connection)
            }
            Err(e) => {
                log::error!("Failed to connect to Redis: {e}");
                Err(e)
            }
        }
    }
}

pub struct Builder {
    client: Option<Client>,
    link: Link,
    key_prefix: Option<String>,
    timeout: Duration,
}

impl Builder {
    /// Apply an optional prefix to all rate limit keys given to this store.
    ///
    /// This may be useful when the Redis instance is being used for other purposes; the prefix is
    /// used as a 'namespace' to avoid collision with other caches or keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    /// Upper bound on each round trip to Redis. Defaults to 500ms.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> RedisStore {
        RedisStore {
            client: self.client,
            link: Arc::new(Mutex::new(self.link)),
            key_prefix: self.key_prefix,
            timeout: self.timeout,
        }
    }
}

fn parse_entry(key: &str, fields: Vec<Option<String>>) -> Option<CounterEntry> {
    if fields.iter().all(Option::is_none) {
        return None;
    }
    let parsed = match fields.as_slice() {
        [Some(count), Some(reset_at)] => count
            .parse::<u64>()
            .ok()
            .zip(reset_at.parse::<u64>().ok())
            .map(|(count, reset_at)| CounterEntry { count, reset_at }),
        _ => None,
    };
    if parsed.is_none() {
        log::warn!("Ignoring corrupt rate limit entry for key {key}: {fields:?}");
    }
    parsed
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<CounterEntry>> {
        let key = self.make_key(key);
        let mut con = self.connection().await?;
        let mut invocation = GET.prepare_invoke();
        invocation.key(key.as_ref());
        let fields: Vec<Option<String>> =
            self.bounded(invocation.invoke_async(&mut con)).await?;
        Ok(parse_entry(&key, fields))
    }

    async fn set(&self, key: &str, entry: CounterEntry) -> Result<()> {
        let key = self.make_key(key);
        let mut con = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(key.as_ref())
            .ignore()
            .hset_multiple(
                key.as_ref(),
                &[(COUNT_FIELD, entry.count), (RESET_AT_FIELD, entry.reset_at)],
            )
            .ignore()
            // A reset time already in the past deletes the key straight away
            .cmd("PEXPIREAT")
            .arg(key.as_ref())
            .arg(entry.reset_at)
            .ignore();

        let () = self.bounded(pipe.query_async(&mut con)).await?;
        Ok(())
    }

    async fn insert_if_vacant(
        &self,
        key: &str,
        entry: CounterEntry,
        now_ms: u64,
    ) -> Result<CounterEntry> {
        let key = self.make_key(key);
        let mut con = self.connection().await?;
        let mut invocation = INSERT_IF_VACANT.prepare_invoke();
        invocation
            .key(key.as_ref())
            .arg(entry.count)
            .arg(entry.reset_at)
            .arg(now_ms);
        let (count, reset_at): (u64, u64) =
            self.bounded(invocation.invoke_async(&mut con)).await?;
        Ok(CounterEntry { count, reset_at })
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        let key = self.make_key(key);
        let mut con = self.connection().await?;
        let mut invocation = INCREMENT.prepare_invoke();
        invocation.key(key.as_ref());
        self.bounded(invocation.invoke_async(&mut con)).await
    }

    async fn increment_within(&self, key: &str, limit: u64) -> Result<Increment> {
        let key = self.make_key(key);
        let mut con = self.connection().await?;
        let mut invocation = INCREMENT_WITHIN.prepare_invoke();
        invocation.key(key.as_ref()).arg(limit);
        let count: i64 = self.bounded(invocation.invoke_async(&mut con)).await?;
        Ok(match count {
            0 => Increment::Missing,
            n if n < 0 => Increment::Full,
            n => Increment::Counted(n as u64),
        })
    }
}
