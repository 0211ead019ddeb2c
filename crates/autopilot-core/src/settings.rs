//! Per-user settings persistence.
//!
//! Records are flat JSON documents keyed by `(user_id, record_key)`. The
//! risk components own the shape of their documents; the store only moves
//! bytes. Instances receive a store at construction, so there is no
//! process-wide settings state.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::TradingMode;
use crate::{Error, Result};

/// Identifies one settings document for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsKey {
    CircuitBreaker,
    ModeAllocation,
    ModeSafety(TradingMode),
    Hedge,
    Trading,
}

impl SettingsKey {
    pub fn record_key(&self) -> String {
        match self {
            SettingsKey::CircuitBreaker => "circuit_breaker".to_string(),
            SettingsKey::ModeAllocation => "mode_allocation".to_string(),
            SettingsKey::ModeSafety(mode) => format!("mode_safety.{mode}"),
            SettingsKey::Hedge => "hedge".to_string(),
            SettingsKey::Trading => "trading".to_string(),
        }
    }
}

impl fmt::Display for SettingsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.record_key())
    }
}

/// Per-user trading toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSettings {
    pub dry_run: bool,
    pub auto_start: bool,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            dry_run: true,
            auto_start: false,
        }
    }
}

/// Storage backend for settings documents.
#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self, user_id: &str, key: SettingsKey) -> Result<Option<serde_json::Value>>;

    async fn save(&self, user_id: &str, key: SettingsKey, value: serde_json::Value) -> Result<()>;
}

/// Load a typed document, falling back to `T::default()` when it is missing
/// or cannot be decoded.
pub async fn load_or_default<T>(store: &dyn SettingsStore, user_id: &str, key: SettingsKey) -> T
where
    T: DeserializeOwned + Default,
{
    match store.load(user_id, key).await {
        Ok(Some(value)) => match serde_json::from_value(value) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(user_id, key = %key, error = %e, "Stored settings unreadable, using defaults");
                T::default()
            }
        },
        Ok(None) => T::default(),
        Err(e) => {
            warn!(user_id, key = %key, error = %e, "Failed to load settings, using defaults");
            T::default()
        }
    }
}

/// Serialize and store a typed document.
pub async fn save_typed<T: Serialize + ?Sized>(
    store: &dyn SettingsStore,
    user_id: &str,
    key: SettingsKey,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_value(value)?;
    store.save(user_id, key, json).await
}

/// In-memory settings storage for testing and paper trading.
pub struct MemorySettingsStore {
    records: Arc<RwLock<HashMap<(String, String), serde_json::Value>>>,
    fail_writes: AtomicBool,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent `save` calls fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self, user_id: &str, key: SettingsKey) -> Result<Option<serde_json::Value>> {
        let records = self.records.read().await;
        Ok(records
            .get(&(user_id.to_string(), key.record_key()))
            .cloned())
    }

    async fn save(&self, user_id: &str, key: SettingsKey, value: serde_json::Value) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::external("settings-store", "write rejected"));
        }
        self.records
            .write()
            .await
            .insert((user_id.to_string(), key.record_key()), value);
        Ok(())
    }
}

/// Postgres-backed settings storage.
///
/// Expects a table:
///
/// ```sql
/// CREATE TABLE autopilot_settings (
///     user_id    TEXT        NOT NULL,
///     record_key TEXT        NOT NULL,
///     value      JSONB       NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
///     PRIMARY KEY (user_id, record_key)
/// );
/// ```
pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SettingsStore for PgSettingsStore {
    async fn load(&self, user_id: &str, key: SettingsKey) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(
            r#"
            SELECT value
            FROM autopilot_settings
            WHERE user_id = $1 AND record_key = $2
            "#,
        )
        .bind(user_id)
        .bind(key.record_key())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<serde_json::Value, _>("value")))
    }

    async fn save(&self, user_id: &str, key: SettingsKey, value: serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO autopilot_settings (user_id, record_key, value, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (user_id, record_key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(key.record_key())
        .bind(&value)
        .execute(&self.pool)
        .await?;

        debug!(user_id, key = %key, "Saved settings record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keys() {
        assert_eq!(SettingsKey::CircuitBreaker.record_key(), "circuit_breaker");
        assert_eq!(
            SettingsKey::ModeSafety(TradingMode::UltraFast).record_key(),
            "mode_safety.ultra_fast"
        );
        assert_eq!(SettingsKey::Trading.to_string(), "trading");
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip_per_user() {
        let store = MemorySettingsStore::new();
        let settings = TradingSettings {
            dry_run: false,
            auto_start: true,
        };
        save_typed(&store, "alice", SettingsKey::Trading, &settings)
            .await
            .unwrap();

        let loaded: TradingSettings = load_or_default(&store, "alice", SettingsKey::Trading).await;
        assert!(!loaded.dry_run);
        assert!(loaded.auto_start);

        let other: TradingSettings = load_or_default(&store, "bob", SettingsKey::Trading).await;
        assert!(other.dry_run);
        assert!(!other.auto_start);
    }

    #[tokio::test]
    async fn test_unreadable_record_falls_back_to_default() {
        let store = MemorySettingsStore::new();
        store
            .save("alice", SettingsKey::Trading, serde_json::json!("garbage"))
            .await
            .unwrap();

        let loaded: TradingSettings = load_or_default(&store, "alice", SettingsKey::Trading).await;
        assert!(loaded.dry_run);
    }

    #[tokio::test]
    async fn test_failed_writes() {
        let store = MemorySettingsStore::new();
        store.fail_writes(true);
        let result = store
            .save("alice", SettingsKey::Hedge, serde_json::json!({}))
            .await;
        assert!(result.is_err());
        assert!(store.is_empty().await);
    }
}
