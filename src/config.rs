//! Keyed JSON configuration shared across service instances.
//!
//! Budgets, experiment definitions and other operator-tunable values live
//! behind [`ConfigStore`] as JSON documents under string keys, so changing
//! them is a row update instead of a redeploy. The bundled
//! [`MemoryConfigStore`] serves tests and single-instance setups.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::error::Result;

/// Keyed JSON document storage.
///
/// `set` overwrites the whole document for a key. Readers that share a key
/// must tolerate concurrent overwrites; writers needing read-modify-write
/// atomicity should keep that state under a single key.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>>;

    async fn set(&self, key: &str, value: JsonValue) -> Result<()>;

    /// Keys starting with `prefix`, in no particular order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-process store backed by a `HashMap`. Values are lost on restart.
#[derive(Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<String, JsonValue>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: JsonValue) -> Result<()> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .values
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
