//! Redis-backed discovery.
//!
//! Records live under `/registry/{node-id}` as plain strings with `SET EX`
//! leases. Redis has no change feed for key expiry we can rely on, so a watch
//! polls a snapshot at a fixed interval and diffs it against the previous
//! one.

use super::{DiscoveryBackend, WatchEvent};
use crate::error::RegistryError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Key namespace for node records.
pub const REGISTRY_NAMESPACE: &str = "/registry/";

/// Default interval between watch snapshots.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const SCAN_COUNT: usize = 100;
const EVENT_BUFFER: usize = 256;

/// Discovery backend on a shared Redis.
///
/// Cheaply cloneable; the multiplexed connection is shared.
#[derive(Clone)]
pub struct RedisDiscovery {
    connection: MultiplexedConnection,
    poll_interval: Duration,
}

impl RedisDiscovery {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Backend` if the connection cannot be made.
    pub async fn connect(redis_url: &str) -> Result<Self, RegistryError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do not log the URL, it may carry credentials.
            error!(target: "registry.redis", error = %e, "Failed to open Redis client");
            RegistryError::Backend(format!("Failed to open Redis client: {e}"))
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "registry.redis", error = %e, "Failed to connect to Redis");
                RegistryError::Backend(format!("Failed to connect to Redis: {e}"))
            })?;
        Ok(Self::from_connection(connection))
    }

    #[must_use]
    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn snapshot(&self, prefix: &str) -> Result<HashMap<String, String>, RegistryError> {
        Ok(self.list(prefix).await?.into_iter().collect())
    }
}

fn record_key(node_id: &str) -> String {
    format!("{REGISTRY_NAMESPACE}{node_id}")
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
pub(crate) fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Events that turn `before` into `after`.
fn diff(before: &HashMap<String, String>, after: &HashMap<String, String>) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    for (key, value) in after {
        if before.get(key) != Some(value) {
            events.push(WatchEvent::Put {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            events.push(WatchEvent::Delete { key: key.clone() });
        }
    }
    events
}

#[async_trait]
impl DiscoveryBackend for RedisDiscovery {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RegistryError> {
        let mut conn = self.connection.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(record_key(key), value, seconds)
            .await
            .map_err(|e| RegistryError::Backend(format!("SET failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(record_key(key))
            .await
            .map_err(|e| RegistryError::Backend(format!("DEL failed: {e}")))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, RegistryError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", escape_glob(&record_key(prefix)));

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| RegistryError::Backend(format!("SCAN failed: {e}")))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            // A key can expire between SCAN and GET.
            let value: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| RegistryError::Backend(format!("GET failed: {e}")))?;
            if let (Some(value), Some(node_id)) = (value, key.strip_prefix(REGISTRY_NAMESPACE)) {
                records.push((node_id.to_string(), value));
            }
        }
        records.sort();
        Ok(records)
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, RegistryError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let backend = self.clone();
        let prefix = prefix.to_string();
        let mut known = backend.snapshot(&prefix).await?;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(backend.poll_interval);
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let current = match backend.snapshot(&prefix).await {
                    Ok(current) => current,
                    Err(e) => {
                        warn!(target: "registry.redis", error = %e, "Registry snapshot failed");
                        continue;
                    }
                };
                for event in diff(&known, &current) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                known = current;
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_diff_reports_new_changed_and_vanished() {
        let before = map(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let after = map(&[("a", "1"), ("b", "20"), ("d", "4")]);

        let mut events = diff(&before, &after);
        events.sort_by(|x, y| x.key().cmp(y.key()));

        assert_eq!(
            events,
            vec![
                WatchEvent::Put {
                    key: "b".to_string(),
                    value: "20".to_string()
                },
                WatchEvent::Delete {
                    key: "c".to_string()
                },
                WatchEvent::Put {
                    key: "d".to_string(),
                    value: "4".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_diff_of_identical_snapshots_is_empty() {
        let snapshot = map(&[("a", "1")]);
        assert!(diff(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("/registry/relay-"), "/registry/relay-");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }
}
