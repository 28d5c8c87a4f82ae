//! Versioned prompt templates.
//!
//! Prompt text lives in storage, not in code, so wording changes ship
//! without a deploy. Versions are append-only: editing a prompt appends a
//! new version and the old ones stay readable for experiments and audits.
//! At most one version per key is active; activation flips the pointer
//! atomically so readers never observe zero or two active versions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{AiError, Result};

/// One immutable revision of a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    pub key: String,
    /// 1-based, monotonically increasing per key.
    pub version: u32,
    pub content: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Prompt store
// ============================================================================

/// Versioned prompt storage.
#[async_trait]
pub trait PromptStore: Send + Sync {
    /// All versions for `key`, oldest first. Empty when the key is unknown.
    async fn versions(&self, key: &str) -> Result<Vec<PromptVersion>>;

    /// Append a new inactive version and return it.
    async fn append_version(&self, key: &str, content: &str) -> Result<PromptVersion>;

    /// Make `version` the single active version for `key`.
    ///
    /// The previous active flag and the new one flip under one lock, so no
    /// reader sees an in-between state. Unknown key or version is
    /// [`AiError::NotFound`].
    async fn activate(&self, key: &str, version: u32) -> Result<()>;

    /// The active version for `key`, if one has been activated.
    async fn active(&self, key: &str) -> Result<Option<PromptVersion>>;

    /// Every key with at least one version.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-process store for tests and single-instance setups.
#[derive(Default)]
pub struct MemoryPromptStore {
    prompts: RwLock<HashMap<String, Vec<PromptVersion>>>,
}

impl MemoryPromptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PromptStore for MemoryPromptStore {
    async fn versions(&self, key: &str) -> Result<Vec<PromptVersion>> {
        Ok(self.prompts.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn append_version(&self, key: &str, content: &str) -> Result<PromptVersion> {
        let mut prompts = self.prompts.write().await;
        let versions = prompts.entry(key.to_string()).or_default();
        let version = PromptVersion {
            key: key.to_string(),
            version: versions.len() as u32 + 1,
            content: content.to_string(),
            active: false,
            created_at: Utc::now(),
        };
        versions.push(version.clone());
        Ok(version)
    }

    async fn activate(&self, key: &str, version: u32) -> Result<()> {
        let mut prompts = self.prompts.write().await;
        let versions = prompts
            .get_mut(key)
            .ok_or_else(|| AiError::NotFound(format!("prompt key '{key}'")))?;
        if !versions.iter().any(|v| v.version == version) {
            return Err(AiError::NotFound(format!(
                "prompt '{key}' has no version {version}"
            )));
        }
        for v in versions.iter_mut() {
            v.active = v.version == version;
        }
        Ok(())
    }

    async fn active(&self, key: &str) -> Result<Option<PromptVersion>> {
        Ok(self
            .prompts
            .read()
            .await
            .get(key)
            .and_then(|versions| versions.iter().find(|v| v.active).cloned()))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.prompts.read().await.keys().cloned().collect())
    }
}

// ============================================================================
// Prompt manager
// ============================================================================

/// Operations over the prompt store.
#[derive(Clone)]
pub struct PromptManager {
    store: Arc<dyn PromptStore>,
}

impl PromptManager {
    pub fn new(store: Arc<dyn PromptStore>) -> Self {
        Self { store }
    }

    /// Content of the active version, or `Ok(None)` when the key has no
    /// active version.
    pub async fn active_prompt(&self, key: &str) -> Result<Option<String>> {
        Ok(self.active_version(key).await?.map(|v| v.content))
    }

    /// The active version record, carrying the version number for
    /// telemetry.
    pub async fn active_version(&self, key: &str) -> Result<Option<PromptVersion>> {
        self.store.active(key).await
    }

    /// Stage a new version without changing what is live.
    pub async fn create_version(&self, key: &str, content: &str) -> Result<PromptVersion> {
        self.store.append_version(key, content).await
    }

    /// Append a new version and make it live in one call. Prior versions
    /// are retained.
    pub async fn update_prompt(&self, key: &str, content: &str) -> Result<PromptVersion> {
        let mut version = self.store.append_version(key, content).await?;
        self.store.activate(key, version.version).await?;
        version.active = true;
        Ok(version)
    }

    /// Make an existing version live.
    pub async fn activate_version(&self, key: &str, version: u32) -> Result<()> {
        self.store.activate(key, version).await
    }

    /// A specific version by number.
    pub async fn version(&self, key: &str, version: u32) -> Result<Option<PromptVersion>> {
        Ok(self
            .store
            .versions(key)
            .await?
            .into_iter()
            .find(|v| v.version == version))
    }

    pub async fn list_versions(&self, key: &str) -> Result<Vec<PromptVersion>> {
        self.store.versions(key).await
    }

    pub async fn list_keys(&self) -> Result<Vec<String>> {
        self.store.keys().await
    }

    /// Seed `(key, content)` pairs that have no versions yet: each becomes
    /// version 1 and is activated. Keys that already exist are left alone,
    /// so redeploys never clobber operator edits.
    pub async fn initialize_defaults(&self, defaults: &[(&str, &str)]) -> Result<()> {
        for (key, content) in defaults {
            if self.store.versions(key).await?.is_empty() {
                let version = self.store.append_version(key, content).await?;
                self.store.activate(key, version.version).await?;
            }
        }
        Ok(())
    }
}
