//! Key/value transports for detection metadata.

use anyhow::{anyhow, Context, Result};
use redis::Commands;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::MetadataSettings;

/// Record store with expiry and change notifications.
///
/// Every call must return within the store's configured I/O timeout.
pub trait MetadataStore: Send {
    fn describe(&self) -> String;

    /// Round-trip check used at construction.
    fn ping(&mut self) -> Result<()>;

    /// Drop the current connection and open a new one.
    fn reconnect(&mut self) -> Result<()>;

    /// Write one hash record that expires after `ttl`.
    fn write_record(
        &mut self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Duration,
    ) -> Result<()>;

    fn notify(&mut self, channel: &str, payload: &str) -> Result<()>;

    /// Number of live keys matching a glob pattern.
    fn count_matching(&mut self, pattern: &str) -> Result<u64>;
}

/// Build the `redis://` connection URL for the configured server.
pub fn redis_url(settings: &MetadataSettings) -> Result<url::Url> {
    let mut url = url::Url::parse(&format!(
        "redis://{}:{}/{}",
        settings.host, settings.port, settings.db
    ))
    .with_context(|| format!("invalid redis address {}:{}", settings.host, settings.port))?;
    if let Some(password) = settings.password.as_deref() {
        url.set_password(Some(password))
            .map_err(|_| anyhow!("cannot attach password to redis url"))?;
    }
    Ok(url)
}

pub struct RedisStore {
    client: redis::Client,
    conn: redis::Connection,
    timeout: Duration,
    address: String,
}

impl RedisStore {
    /// Connect within `settings.connect_timeout`; the same bound is applied to
    /// every later read and write on the connection, and to reconnects.
    pub fn connect(settings: &MetadataSettings) -> Result<Self> {
        let url = redis_url(settings)?;
        let client = redis::Client::open(url.as_str()).context("invalid redis connection info")?;
        let address = format!("redis {}:{}/{}", settings.host, settings.port, settings.db);
        let conn = open_connection(&client, settings.connect_timeout)
            .with_context(|| format!("failed to connect to {}", address))?;
        Ok(Self {
            client,
            conn,
            timeout: settings.connect_timeout,
            address,
        })
    }
}

fn open_connection(client: &redis::Client, timeout: Duration) -> Result<redis::Connection> {
    let conn = client.get_connection_with_timeout(timeout)?;
    conn.set_read_timeout(Some(timeout))
        .context("failed to set redis read timeout")?;
    conn.set_write_timeout(Some(timeout))
        .context("failed to set redis write timeout")?;
    Ok(conn)
}

impl MetadataStore for RedisStore {
    fn describe(&self) -> String {
        self.address.clone()
    }

    fn ping(&mut self) -> Result<()> {
        let _: String = redis::cmd("PING")
            .query(&mut self.conn)
            .context("redis PING failed")?;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.conn = open_connection(&self.client, self.timeout)
            .with_context(|| format!("failed to reconnect to {}", self.address))?;
        Ok(())
    }

    fn write_record(
        &mut self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Duration,
    ) -> Result<()> {
        redis::pipe()
            .atomic()
            .hset_multiple(key, fields)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query::<()>(&mut self.conn)
            .with_context(|| format!("failed to write record {}", key))
    }

    fn notify(&mut self, channel: &str, payload: &str) -> Result<()> {
        let _: i64 = self
            .conn
            .publish(channel, payload)
            .with_context(|| format!("failed to publish on {}", channel))?;
        Ok(())
    }

    fn count_matching(&mut self, pattern: &str) -> Result<u64> {
        let keys = self
            .conn
            .scan_match::<_, String>(pattern)
            .with_context(|| format!("failed to scan {}", pattern))?;
        Ok(keys.count() as u64)
    }
}

/// A record held by [`MemoryStore`].
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRecord {
    pub fields: BTreeMap<String, String>,
    pub ttl: Duration,
}

#[derive(Default)]
struct MemoryInner {
    records: BTreeMap<String, StoredRecord>,
    notifications: Vec<(String, String)>,
    failing: bool,
    disconnected: bool,
    reconnects: u64,
}

/// In-process store for tests and dry runs. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing = failing;
        }
    }

    /// Break the current connection: every call fails until `reconnect`.
    pub fn disconnect(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.disconnected = true;
        }
    }

    /// Successful reconnects so far.
    pub fn reconnects(&self) -> u64 {
        self.inner.lock().map(|inner| inner.reconnects).unwrap_or(0)
    }

    pub fn records(&self) -> BTreeMap<String, StoredRecord> {
        self.inner
            .lock()
            .map(|inner| inner.records.clone())
            .unwrap_or_default()
    }

    /// Published `(channel, payload)` pairs in publish order.
    pub fn notifications(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .map(|inner| inner.notifications.clone())
            .unwrap_or_default()
    }

    fn with_inner<T>(&self, op: impl FnOnce(&mut MemoryInner) -> T) -> Result<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        if inner.failing {
            return Err(anyhow!("memory store unavailable"));
        }
        if inner.disconnected {
            return Err(anyhow!("memory store connection lost"));
        }
        Ok(op(&mut inner))
    }
}

impl MetadataStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn ping(&mut self) -> Result<()> {
        self.with_inner(|_| ())
    }

    fn reconnect(&mut self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        if inner.failing {
            return Err(anyhow!("memory store unavailable"));
        }
        inner.disconnected = false;
        inner.reconnects += 1;
        Ok(())
    }

    fn write_record(
        &mut self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Duration,
    ) -> Result<()> {
        self.with_inner(|inner| {
            let record = inner
                .records
                .entry(key.to_string())
                .or_insert_with(|| StoredRecord {
                    fields: BTreeMap::new(),
                    ttl,
                });
            for (name, value) in fields {
                record.fields.insert(name.to_string(), value.clone());
            }
            record.ttl = ttl;
        })
    }

    fn notify(&mut self, channel: &str, payload: &str) -> Result<()> {
        self.with_inner(|inner| {
            inner
                .notifications
                .push((channel.to_string(), payload.to_string()));
        })
    }

    fn count_matching(&mut self, pattern: &str) -> Result<u64> {
        self.with_inner(|inner| {
            inner
                .records
                .keys()
                .filter(|key| glob_match(pattern, key))
                .count() as u64
        })
    }
}

/// Minimal glob: a single trailing `*` or an exact match.
fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => pattern == key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_carries_db_and_password() {
        let mut settings = MetadataSettings::default();
        settings.host = "cache.local".to_string();
        settings.port = 6380;
        settings.db = 2;
        assert_eq!(redis_url(&settings).unwrap().as_str(), "redis://cache.local:6380/2");

        settings.password = Some("s3cret".to_string());
        assert_eq!(
            redis_url(&settings).unwrap().as_str(),
            "redis://:s3cret@cache.local:6380/2"
        );
    }

    #[test]
    fn memory_store_counts_by_prefix() {
        let mut store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.write_record("image_metadata:1", &[("a", "1".into())], ttl).unwrap();
        store.write_record("image_metadata:2", &[("a", "2".into())], ttl).unwrap();
        store.write_record("other:1", &[("a", "3".into())], ttl).unwrap();

        assert_eq!(store.count_matching("image_metadata:*").unwrap(), 2);
        assert_eq!(store.count_matching("other:1").unwrap(), 1);
    }

    #[test]
    fn failing_memory_store_rejects_everything() {
        let mut store = MemoryStore::new();
        let observer = store.clone();
        observer.set_failing(true);
        assert!(store.ping().is_err());
        assert!(store.notify("c", "k").is_err());
        observer.set_failing(false);
        store.notify("c", "k").unwrap();
        assert_eq!(observer.notifications(), vec![("c".to_string(), "k".to_string())]);
    }

    #[test]
    fn disconnected_memory_store_recovers_on_reconnect() {
        let mut store = MemoryStore::new();
        let observer = store.clone();
        observer.disconnect();
        assert!(store.ping().is_err());

        observer.set_failing(true);
        assert!(store.reconnect().is_err());
        observer.set_failing(false);

        store.reconnect().unwrap();
        store.ping().unwrap();
        assert_eq!(observer.reconnects(), 1);
    }

    #[test]
    fn unreachable_redis_fails_within_timeout() {
        let mut settings = MetadataSettings::default();
        // reserved TEST-NET address, nothing listens there
        settings.host = "192.0.2.1".to_string();
        settings.connect_timeout = Duration::from_millis(200);
        let started = std::time::Instant::now();
        assert!(RedisStore::connect(&settings).is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
