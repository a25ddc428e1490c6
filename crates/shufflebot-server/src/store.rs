use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use shufflebot_kernel::{new_secret, secret_key, secrets_match};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kv backend failure: {0}")]
    Backend(String),
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}

/// Host-provided key-value store with per-key expiry. Absent and expired keys
/// both read as `None`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<(), StoreError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(Duration::from_secs(ttl_seconds))
            .ok_or_else(|| StoreError::Backend(format!("ttl out of range: {ttl_seconds}s")))?;
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    pub fn open(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expires_at INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    async fn put(&self, key: &str, value: &[u8], expires_at: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "
            INSERT INTO kv(key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value=excluded.value,
                expires_at=excluded.expires_at
            ",
            params![key, value, expires_at],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn prune(&self, now: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM kv WHERE expires_at <= ?1", params![now])
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<(), StoreError> {
        let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
        let now = Utc::now().timestamp();
        self.prune(now).await?;
        self.put(key, &value, now.saturating_add(ttl)).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock().await;
        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match row {
            Some((value, expires_at)) if expires_at > Utc::now().timestamp() => Ok(Some(value)),
            Some(_) => {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Per-interaction secrets, one live secret per scope.
#[derive(Clone)]
pub struct SecretStore {
    kv: Arc<dyn KvStore>,
    ttl_seconds: u64,
}

impl SecretStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl_seconds: u64) -> Self {
        Self { kv, ttl_seconds }
    }

    /// Issues a fresh secret for `scope`, replacing any earlier one.
    pub async fn mint(&self, scope: &str) -> Result<String, StoreError> {
        let secret = new_secret();
        let data =
            serde_json::to_vec(&secret).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.kv
            .set(&secret_key(scope), data, self.ttl_seconds)
            .await?;
        Ok(secret)
    }

    pub async fn verify(&self, scope: &str, candidate: &str) -> Result<bool, StoreError> {
        let Some(data) = self.kv.get(&secret_key(scope)).await? else {
            return Ok(false);
        };
        let expected: String =
            serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(secrets_match(&expected, candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_secrets(ttl_seconds: u64) -> SecretStore {
        SecretStore::new(Arc::new(MemoryKv::default()), ttl_seconds)
    }

    #[tokio::test]
    async fn minted_secret_verifies_for_its_scope_only() {
        let secrets = memory_secrets(60);
        let s = secrets.mint("root-1").await.unwrap();
        assert!(secrets.verify("root-1", &s).await.unwrap());
        assert!(!secrets.verify("root-2", &s).await.unwrap());
        assert!(!secrets.verify("root-1", "forged").await.unwrap());
        assert!(!secrets.verify("never-minted", "").await.unwrap());
    }

    #[tokio::test]
    async fn remint_invalidates_previous_secret() {
        let secrets = memory_secrets(60);
        let old = secrets.mint("root-1").await.unwrap();
        let new = secrets.mint("root-1").await.unwrap();
        assert!(!secrets.verify("root-1", &old).await.unwrap());
        assert!(secrets.verify("root-1", &new).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn secret_expires_after_ttl() {
        let secrets = memory_secrets(30);
        let s = secrets.mint("root-1").await.unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(secrets.verify("root-1", &s).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!secrets.verify("root-1", &s).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_record_is_a_fault_not_a_rejection() {
        let kv = Arc::new(MemoryKv::default());
        kv.set(&secret_key("root-1"), b"not json".to_vec(), 60)
            .await
            .unwrap();
        let secrets = SecretStore::new(kv, 60);
        let err = secrets.verify("root-1", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn sqlite_kv_overwrites_and_expires() {
        let kv = SqliteKv::open(":memory:").unwrap();
        kv.set("k", b"one".to_vec(), 60).await.unwrap();
        kv.set("k", b"two".to_vec(), 60).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(kv.get("missing").await.unwrap(), None);

        kv.put("old", b"stale", Utc::now().timestamp() - 1)
            .await
            .unwrap();
        assert_eq!(kv.get("old").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_kv_sweeps_expired_entries_on_write() {
        let kv = MemoryKv::default();
        for i in 0..100 {
            kv.set(&format!("k{i}"), b"v".to_vec(), 1).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        kv.set("fresh", b"v".to_vec(), 60).await.unwrap();
        assert_eq!(kv.entries.lock().await.len(), 1);
        assert_eq!(kv.get("fresh").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn sqlite_kv_sweeps_expired_rows_on_write() {
        let kv = SqliteKv::open(":memory:").unwrap();
        let past = Utc::now().timestamp() - 10;
        for i in 0..100 {
            kv.put(&format!("k{i}"), b"v", past).await.unwrap();
        }
        kv.set("fresh", b"v".to_vec(), 60).await.unwrap();
        let rows: i64 = kv
            .conn
            .lock()
            .await
            .query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn oversized_ttl_is_an_error_not_a_panic() {
        let secrets = memory_secrets(u64::MAX);
        let err = secrets.mint("root-1").await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));

        let secrets = SecretStore::new(Arc::new(SqliteKv::open(":memory:").unwrap()), u64::MAX);
        let s = secrets.mint("root-1").await.unwrap();
        assert!(secrets.verify("root-1", &s).await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_backed_secrets_round_trip() {
        let secrets = SecretStore::new(Arc::new(SqliteKv::open(":memory:").unwrap()), 60);
        let s = secrets.mint("chan-1").await.unwrap();
        assert!(secrets.verify("chan-1", &s).await.unwrap());
    }
}
