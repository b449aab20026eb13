//! Endpoint registry: logical key → `{baseAddress, instrumentIdentifier}`.
//!
//! Static routing configuration consumed by the RPC gateway.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use serde_json::Value;
use tokio::sync::Mutex;

use labsync_core::Endpoint;

use super::{atomic_write_json, read_json, StoreError, ENDPOINTS_FILE};

/// Endpoint map persisted as a JSON object.
pub struct EndpointRegistry {
    path: Option<PathBuf>,
    endpoints: Mutex<BTreeMap<String, Endpoint>>,
}

impl EndpointRegistry {
    pub fn in_memory() -> Self {
        Self::from_map(BTreeMap::new())
    }

    /// In-memory registry seeded with `endpoints`.
    pub fn from_map(endpoints: BTreeMap<String, Endpoint>) -> Self {
        Self {
            path: None,
            endpoints: Mutex::new(endpoints),
        }
    }

    /// Open `endpoints.json` inside `dir`. Missing or invalid files load empty.
    pub async fn open(dir: impl AsRef<Path>) -> Self {
        let path = dir.as_ref().join(ENDPOINTS_FILE);
        let endpoints = read_json(&path)
            .await
            .map(|v| parse_endpoints(&v))
            .unwrap_or_default();
        log::info!("Loaded {} endpoints from {}", endpoints.len(), path.display());
        Self {
            path: Some(path),
            endpoints: Mutex::new(endpoints),
        }
    }

    pub async fn list(&self) -> BTreeMap<String, Endpoint> {
        self.endpoints.lock().await.clone()
    }

    pub async fn get(&self, key: &str) -> Option<Endpoint> {
        self.endpoints.lock().await.get(key).cloned()
    }

    /// Insert or replace one endpoint.
    pub async fn set(&self, key: &str, endpoint: Endpoint) -> Result<(), StoreError> {
        validate(key, &endpoint)?;
        let mut endpoints = self.endpoints.lock().await;
        let mut next = endpoints.clone();
        next.insert(key.to_string(), endpoint);
        self.persist(&next).await?;
        *endpoints = next;
        Ok(())
    }

    /// Insert or replace several endpoints at once.
    ///
    /// Every entry is validated first; one invalid entry rejects the batch.
    /// A failed write leaves the registry as it was.
    pub async fn set_many(
        &self,
        batch: BTreeMap<String, Endpoint>,
    ) -> Result<BTreeMap<String, Endpoint>, StoreError> {
        for (key, endpoint) in &batch {
            validate(key, endpoint)?;
        }
        let mut endpoints = self.endpoints.lock().await;
        let mut next = endpoints.clone();
        next.extend(batch);
        self.persist(&next).await?;
        *endpoints = next.clone();
        Ok(next)
    }

    /// [`set_many`](Self::set_many) from an untyped JSON object.
    pub async fn set_many_json(&self, raw: &Value) -> Result<BTreeMap<String, Endpoint>, StoreError> {
        let Value::Object(map) = raw else {
            return Err(StoreError::Invalid("invalid body".into()));
        };
        let mut batch = BTreeMap::new();
        for (key, value) in map {
            let endpoint: Endpoint = serde_json::from_value(value.clone())
                .map_err(|_| StoreError::Invalid(format!("endpoint {key} invalid")))?;
            batch.insert(key.clone(), endpoint);
        }
        self.set_many(batch).await
    }

    async fn persist(&self, endpoints: &BTreeMap<String, Endpoint>) -> Result<(), StoreError> {
        match &self.path {
            Some(path) => atomic_write_json(path, endpoints).await,
            None => Ok(()),
        }
    }
}

fn validate(key: &str, endpoint: &Endpoint) -> Result<(), StoreError> {
    if endpoint.is_configured() {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!("endpoint {key} invalid")))
    }
}

fn parse_endpoints(raw: &Value) -> BTreeMap<String, Endpoint> {
    let Value::Object(map) = raw else {
        return BTreeMap::new();
    };
    map.iter()
        .map(|(key, value)| {
            let endpoint = serde_json::from_value(value.clone()).unwrap_or_default();
            (key.clone(), endpoint)
        })
        .collect()
}
