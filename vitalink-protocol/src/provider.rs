//! Data provider seam
//!
//! The server does not own the payload data it serves; a [`DataProvider`]
//! collaborator supplies it through a narrow query interface. Provider
//! failures are mapped to a generic 500 by the router; details stay in
//! server-side logs.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Errors a data provider can surface
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The requested resource does not exist
    #[error("unknown resource: {0}")]
    NotFound(String),

    /// The query failed downstream
    #[error("query failed: {0}")]
    Query(String),
}

/// Narrow interface to the payload data the API serves
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Query a resource by its path segment under `/api/v1/data/`,
    /// with the raw query string if one was present
    async fn query(
        &self,
        resource: &str,
        params: Option<&str>,
    ) -> std::result::Result<serde_json::Value, ProviderError>;
}

/// Fixed-content provider for tests and demos
#[derive(Default)]
pub struct StaticProvider {
    resources: HashMap<String, serde_json::Value>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource under a path segment
    pub fn with_resource(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.resources.insert(name.into(), value);
        self
    }
}

#[async_trait]
impl DataProvider for StaticProvider {
    async fn query(
        &self,
        resource: &str,
        _params: Option<&str>,
    ) -> std::result::Result<serde_json::Value, ProviderError> {
        self.resources
            .get(resource)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(resource.to_string()))
    }
}
