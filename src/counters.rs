//! Key-value counter store holding the edge's rate-limit counters.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;

use crate::error::Result;

/// The subset of a key-value store the pipeline needs.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Every key matching a glob-style `pattern`.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Integer value of `key`, or `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Remaining time to live in seconds. Follows Redis: `-1` for no expiry,
    /// `-2` for a missing key.
    async fn ttl(&self, key: &str) -> Result<i64>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// Redis-backed counter store.
///
/// The connection is opened on first use, so a Redis that is down at startup
/// shows up as failed calls rather than a failed boot. Once open,
/// `ConnectionManager` reconnects on its own.
pub struct RedisCounterStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisCounterStore {
    /// Validate `redis_url` without connecting.
    pub fn new(redis_url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut iter = conn.scan_match::<_, String>(pattern).await?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection().await?;
        Ok(conn.ttl(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::error::MonitorError;

    /// In-memory counter store. Keys map to `(value, ttl)`.
    #[derive(Default)]
    pub struct MemoryCounterStore {
        entries: Mutex<HashMap<String, (i64, i64)>>,
        pub fail: bool,
    }

    impl MemoryCounterStore {
        pub fn with(entries: &[(&str, i64, i64)]) -> Self {
            let store = Self::default();
            {
                let mut map = store.entries.lock().unwrap();
                for (key, value, ttl) in entries {
                    map.insert(key.to_string(), (*value, *ttl));
                }
            }
            store
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn contains(&self, key: &str) -> bool {
            self.entries.lock().unwrap().contains_key(key)
        }

        fn check(&self) -> Result<()> {
            if self.fail {
                return Err(MonitorError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "counter store unavailable",
                )));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CounterStore for MemoryCounterStore {
        async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
            self.check()?;
            let prefix = pattern.trim_end_matches('*');
            let mut keys: Vec<String> = self
                .entries
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        }

        async fn get(&self, key: &str) -> Result<Option<i64>> {
            self.check()?;
            Ok(self.entries.lock().unwrap().get(key).map(|(v, _)| *v))
        }

        async fn ttl(&self, key: &str) -> Result<i64> {
            self.check()?;
            Ok(self.entries.lock().unwrap().get(key).map(|(_, t)| *t).unwrap_or(-2))
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.check()?;
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            self.check()
        }
    }
}
