//! Redis KV backend
//!
//! Uses a connection manager so the store survives redis restarts. The
//! watch channel is fed locally on successful writes: the control plane is
//! the only writer of its prefix, so local fan-out is equivalent to a
//! server-side watch without keyspace notifications.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::info;

use super::{KvChange, KvResult, KvStore};

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
else
  if current then return 0 end
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

pub struct RedisKv {
    connection: ConnectionManager,
    changes: broadcast::Sender<KvChange>,
}

impl RedisKv {
    pub async fn connect(url: &str) -> KvResult<Self> {
        info!("Connecting KV store to {}", url);
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        let (changes, _) = broadcast::channel(1024);
        info!("KV store connected");
        Ok(Self {
            connection,
            changes,
        })
    }

    fn notify_put(&self, key: &str, value: &str) {
        let _ = self.changes.send(KvChange::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    fn notify_delete(&self, key: &str) {
        let _ = self.changes.send(KvChange::Delete {
            key: key.to_string(),
        });
    }

    async fn scan_keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.connection.clone();
        Ok(conn.get(key).await?)
    }

    async fn put(&self, key: &str, value: &str) -> KvResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.set(key, value).await?;
        self.notify_put(key, value);
        Ok(())
    }

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await?;
        self.notify_put(key, value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> KvResult<bool> {
        let mut conn = self.connection.clone();
        let script = redis::Script::new(CAS_SCRIPT);
        let swapped: i32 = script
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        let swapped = swapped == 1;
        if swapped {
            self.notify_put(key, value);
        }
        Ok(swapped)
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await?;
        self.notify_delete(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> KvResult<()> {
        let keys = self.scan_keys(&format!("{}*", prefix)).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = conn.del(&keys).await?;
        for key in keys {
            self.notify_delete(&key);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> KvResult<Vec<String>> {
        self.scan_keys(&format!("{}*", prefix)).await
    }

    fn watch(&self) -> broadcast::Receiver<KvChange> {
        self.changes.subscribe()
    }
}
