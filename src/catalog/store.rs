// src/catalog/store.rs
//! Per-job key/value store reachable from runners
//!
//! Runners issue `store-get`, `store-set` and `store-delete` transactions;
//! the controller answers them against a [`KeyValueStore`] scoped by the
//! runner's job.

use crate::utils::errors::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of a store transaction sent by a runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Body of the controller's answer to a store transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, job_id: &str, key: &str) -> Result<Option<Value>>;

    async fn set(&self, job_id: &str, key: &str, value: Value) -> Result<()>;

    /// Returns whether the key existed
    async fn delete(&self, job_id: &str, key: &str) -> Result<bool>;
}

/// Store kept in process memory
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: DashMap<(String, String), Value>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, job_id: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .entries
            .get(&(job_id.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn set(&self, job_id: &str, key: &str, value: Value) -> Result<()> {
        self.entries
            .insert((job_id.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, job_id: &str, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove(&(job_id.to_string(), key.to_string()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scoped_by_job() {
        let store = InMemoryKeyValueStore::new();
        store.set("job-a", "counter", json!(1)).await.unwrap();
        store.set("job-b", "counter", json!(2)).await.unwrap();

        assert_eq!(store.get("job-a", "counter").await.unwrap(), Some(json!(1)));
        assert_eq!(store.get("job-b", "counter").await.unwrap(), Some(json!(2)));
        assert_eq!(store.get("job-c", "counter").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryKeyValueStore::new();
        store.set("job", "k", json!("v")).await.unwrap();

        assert!(store.delete("job", "k").await.unwrap());
        assert!(!store.delete("job", "k").await.unwrap());
        assert!(store.is_empty());
    }
}
