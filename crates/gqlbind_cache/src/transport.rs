//! Transport contract and an in-process mock transport.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::document::{Document, Variables};
use crate::error::QueryError;

/// An operation to execute.
#[derive(Debug, Clone)]
pub struct Request {
    pub document: Document,
    pub variables: Variables,
}

impl Request {
    /// Creates a request.
    pub fn new(document: Document, variables: Variables) -> Self {
        Self {
            document,
            variables,
        }
    }
}

/// Executes GraphQL operations. Returns the `data` of the response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: Request) -> Result<Value, QueryError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn execute(&self, request: Request) -> Result<Value, QueryError> {
        (**self).execute(request).await
    }
}

/// Mock transport configuration.
#[derive(Debug, Clone)]
pub struct MockTransportConfig {
    /// Simulated response latency.
    pub latency: Duration,
}

impl Default for MockTransportConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(500),
        }
    }
}

impl MockTransportConfig {
    /// Sets the latency.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Answers one operation from its variables.
pub type MockResolver = Arc<dyn Fn(&Variables) -> Result<Value, QueryError> + Send + Sync>;

/// A transport answering operations by name with registered resolvers.
///
/// Every call sleeps for the configured latency before resolving, which
/// under a paused Tokio clock advances deterministically.
pub struct MockTransport {
    config: MockTransportConfig,
    resolvers: RwLock<FxHashMap<String, MockResolver>>,
    calls: RwLock<FxHashMap<String, usize>>,
    total_calls: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(MockTransportConfig::default())
    }
}

impl MockTransport {
    /// Creates a mock transport without resolvers.
    pub fn new(config: MockTransportConfig) -> Self {
        Self {
            config,
            resolvers: RwLock::new(FxHashMap::default()),
            calls: RwLock::new(FxHashMap::default()),
            total_calls: AtomicUsize::new(0),
        }
    }

    /// Adds a resolver for the operation named `operation`.
    pub fn resolver<F>(self, operation: impl Into<String>, resolver: F) -> Self
    where
        F: Fn(&Variables) -> Result<Value, QueryError> + Send + Sync + 'static,
    {
        self.register(operation, resolver);
        self
    }

    /// Registers or replaces a resolver.
    pub fn register<F>(&self, operation: impl Into<String>, resolver: F)
    where
        F: Fn(&Variables) -> Result<Value, QueryError> + Send + Sync + 'static,
    {
        self.resolvers
            .write()
            .insert(operation.into(), Arc::new(resolver));
    }

    /// Number of executed operations.
    pub fn call_count(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Number of executions of one operation.
    pub fn calls_for(&self, operation: &str) -> usize {
        self.calls.read().get(operation).copied().unwrap_or(0)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MockTransportConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: Request) -> Result<Value, QueryError> {
        let name = request.document.operation_name().unwrap_or_default().to_owned();
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *self.calls.write().entry(name.clone()).or_insert(0) += 1;
        debug!(operation = %name, latency_ms = self.config.latency.as_millis() as u64, "mock request");

        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }

        let resolver = self.resolvers.read().get(&name).cloned();
        match resolver {
            Some(resolve) => resolve(&request.variables),
            None => Err(QueryError::resolver_not_found(&request.document)),
        }
    }
}
