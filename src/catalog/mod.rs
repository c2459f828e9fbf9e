// src/catalog/mod.rs
//! Job and action metadata consumed by the controller
//!
//! The relational store behind the dashboard owns this data; the controller
//! only reads it through [`ActionStore`]. An in-memory implementation backs
//! tests and single-node deployments loaded from a JSON manifest.

pub mod store;

use crate::utils::errors::{ControllerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub use store::{InMemoryKeyValueStore, KeyValueStore};

/// How runners for an action are provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerMode {
    /// Long-lived, load-balanced pool
    Standard,
    /// One fresh runner per request
    RunOnce,
}

/// Immutable published version of a job's execution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    pub job_id: String,
    pub runner_mode: RunnerMode,
    #[serde(default)]
    pub runner_min_count: usize,
    /// 0 means unlimited
    #[serde(default)]
    pub runner_max_count: usize,
    /// Whether one runner may serve concurrent requests
    #[serde(default)]
    pub runner_asynchronous: bool,
    /// Request timeout in seconds; 0 uses the controller default
    #[serde(default)]
    pub runner_timeout: u64,
    /// Graceful retirement age in seconds; 0 disables
    #[serde(default)]
    pub runner_max_age: u64,
    /// Forced kill age in seconds; 0 disables
    #[serde(default)]
    pub runner_max_age_hard: u64,
    /// Reference to the packaged code archive
    pub archive: String,
}

impl Action {
    pub fn timeout_or(&self, default: Duration) -> Duration {
        if self.runner_timeout == 0 {
            default
        } else {
            Duration::from_secs(self.runner_timeout)
        }
    }

    /// Whether `active` runners leave room for one more
    pub fn has_capacity_for(&self, active: usize) -> bool {
        self.runner_max_count == 0 || active < self.runner_max_count
    }
}

/// Hash of a job's environment, `None` when the job has no environment
pub fn environment_hash(env: &BTreeMap<String, String>) -> Option<String> {
    if env.is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    for (key, value) in env {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    Some(format!("{:x}", hasher.finalize()))
}

/// Read access to published actions
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// The current action of a job, if any
    async fn current_action(&self, job_id: &str) -> Result<Option<Action>>;

    /// Current actions of every job
    async fn current_actions(&self) -> Result<Vec<Action>>;

    /// Packaged code archive for an action
    async fn archive(&self, action: &Action) -> Result<Bytes>;

    /// Environment variables injected into a job's runners
    async fn environment(&self, job_id: &str) -> Result<BTreeMap<String, String>>;
}

#[derive(Default)]
struct CatalogState {
    current: HashMap<String, Action>,
    archives: HashMap<String, Bytes>,
    environments: HashMap<String, BTreeMap<String, String>>,
}

/// Action store held in memory
#[derive(Default)]
pub struct InMemoryActionStore {
    state: RwLock<CatalogState>,
}

/// Manifest entry used to seed [`InMemoryActionStore`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionManifest {
    #[serde(flatten)]
    pub action: Action,
    /// Path of the archive file, relative to the manifest
    pub archive_path: PathBuf,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl InMemoryActionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load actions from a JSON manifest (an array of [`ActionManifest`])
    pub async fn from_manifest(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path).await.map_err(|e| {
            ControllerError::ConfigError(format!("Failed to read manifest {:?}: {}", path, e))
        })?;
        let entries: Vec<ActionManifest> = serde_json::from_slice(&raw)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let store = Self::new();
        for entry in entries {
            let archive_path = base.join(&entry.archive_path);
            let archive = tokio::fs::read(&archive_path).await.map_err(|e| {
                ControllerError::ConfigError(format!(
                    "Failed to read archive {:?}: {}",
                    archive_path, e
                ))
            })?;
            store.set_environment(&entry.action.job_id, entry.environment);
            store.publish(entry.action, Bytes::from(archive));
        }

        info!(path = ?path, jobs = store.state.read().current.len(), "Loaded action manifest");
        Ok(store)
    }

    /// Publish an action, making it the job's current one
    pub fn publish(&self, action: Action, archive: Bytes) {
        let mut state = self.state.write();
        state.archives.insert(action.archive.clone(), archive);
        state.current.insert(action.job_id.clone(), action);
    }

    /// Remove a job entirely
    pub fn unpublish(&self, job_id: &str) {
        self.state.write().current.remove(job_id);
    }

    pub fn set_environment(&self, job_id: &str, env: BTreeMap<String, String>) {
        self.state.write().environments.insert(job_id.to_string(), env);
    }
}

#[async_trait]
impl ActionStore for InMemoryActionStore {
    async fn current_action(&self, job_id: &str) -> Result<Option<Action>> {
        Ok(self.state.read().current.get(job_id).cloned())
    }

    async fn current_actions(&self) -> Result<Vec<Action>> {
        Ok(self.state.read().current.values().cloned().collect())
    }

    async fn archive(&self, action: &Action) -> Result<Bytes> {
        self.state
            .read()
            .archives
            .get(&action.archive)
            .cloned()
            .ok_or_else(|| {
                ControllerError::RunnerStartFailed(format!("archive {} not found", action.archive))
            })
    }

    async fn environment(&self, job_id: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .state
            .read()
            .environments
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) fn test_action(id: &str, job_id: &str, mode: RunnerMode) -> Action {
    Action {
        id: id.to_string(),
        job_id: job_id.to_string(),
        runner_mode: mode,
        runner_min_count: 0,
        runner_max_count: 0,
        runner_asynchronous: false,
        runner_timeout: 0,
        runner_max_age: 0,
        runner_max_age_hard: 0,
        archive: format!("{}.tar", id),
    }
}
