//! Observable query registry.
//!
//! Deduplicates query handles per cache adapter. A handle is keyed first by
//! document, then by fetch policy and canonical variables, so two requests
//! whose variables differ only in key order share one handle.
//!
//! The registry is stored in the adapter's [`AdapterSlot`](gqlbind_cache::AdapterSlot):
//! every [`Registry::for_adapter`] call on one adapter returns the same
//! registry, and the registry refers back to the adapter weakly.

use gqlbind_cache::{canonical_json, CacheAdapter, Document, DocumentId, FetchPolicy, Variables};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::RuntimeConfig;
use crate::definition::QueryDefinition;
use crate::error::{BindError, BindResult};
use crate::handle::{HandleScheduler, QueryHandle};

/// Computes the registry key of a (fetch policy, variables) pair.
pub fn query_key(fetch_policy: FetchPolicy, variables: &Variables) -> String {
    format!(
        "{}:{}",
        fetch_policy.as_str(),
        canonical_json(&Value::Object(variables.clone()))
    )
}

/// Query handles of one cache adapter.
pub struct Registry {
    adapter: Weak<dyn CacheAdapter>,
    config: RuntimeConfig,
    entries: Mutex<FxHashMap<DocumentId, FxHashMap<String, Arc<QueryHandle>>>>,
    scheduler: Arc<HandleScheduler>,
}

impl Registry {
    /// Returns the registry of `adapter`, creating it on first use.
    ///
    /// `config` only applies to the call that creates the registry. Later
    /// calls get the existing registry with its original configuration.
    pub fn for_adapter(adapter: &dyn CacheAdapter, config: RuntimeConfig) -> Arc<Self> {
        let slot = adapter.slot();
        match slot.get_or_init(|| Self::detached(slot.owner(), config.clone())) {
            Some(registry) => registry,
            None => {
                warn!("adapter slot holds foreign state, registry not shared");
                Self::detached(slot.owner(), config)
            }
        }
    }

    fn detached(adapter: Weak<dyn CacheAdapter>, config: RuntimeConfig) -> Arc<Self> {
        let scheduler = Arc::new(HandleScheduler::new(config.grace_period));
        Arc::new(Self {
            adapter,
            config,
            entries: Mutex::new(FxHashMap::default()),
            scheduler,
        })
    }

    /// The cache adapter, unless it was dropped.
    pub fn adapter(&self) -> BindResult<Arc<dyn CacheAdapter>> {
        self.adapter.upgrade().ok_or(BindError::AdapterDropped)
    }

    /// The configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Returns the handle for a query, creating it on first request.
    pub fn get_or_create(
        &self,
        document: &Document,
        variables: &Variables,
        fetch_policy: FetchPolicy,
    ) -> Arc<QueryHandle> {
        let key = query_key(fetch_policy, variables);
        let mut entries = self.entries.lock();
        let by_document = entries.entry(document.id()).or_default();
        if let Some(handle) = by_document.get(&key) {
            return Arc::clone(handle);
        }
        trace!(%document, key, "query handle created");
        let handle = QueryHandle::new(
            Weak::clone(&self.adapter),
            document.clone(),
            variables.clone(),
            fetch_policy,
            Arc::clone(&self.scheduler),
        );
        by_document.insert(key, Arc::clone(&handle));
        handle
    }

    /// Returns the handle for a definition.
    pub fn handle_for(&self, definition: &QueryDefinition) -> Arc<QueryHandle> {
        self.get_or_create(
            &definition.document,
            &definition.variables,
            definition.effective_policy(self.config.default_fetch_policy),
        )
    }

    /// Number of handles.
    pub fn len(&self) -> usize {
        self.entries.lock().values().map(FxHashMap::len).sum()
    }

    /// Returns true if no handle was created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disposes every handle whose grace period ended at `now`. Returns the
    /// number of handles disposed.
    pub fn dispose_expired(&self, now: Instant) -> usize {
        let disposed = self
            .scheduler
            .pop_expired(now)
            .into_iter()
            .filter_map(|(task, handle)| handle.upgrade().map(|h| h.dispose_scheduled(task)))
            .filter(|disposed| *disposed)
            .count();
        if disposed > 0 {
            debug!(disposed, "idle query handles disposed");
        }
        disposed
    }

    /// The earliest pending disposal.
    pub fn next_disposal(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    /// Runs disposals as their deadlines pass. Never returns; spawn it and
    /// abort the task to stop it.
    pub async fn drive_disposals(self: Arc<Self>) {
        loop {
            let scheduled = self.scheduler.scheduled();
            match self.next_disposal() {
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {
                            self.dispose_expired(Instant::now());
                        }
                        () = scheduled => {}
                    }
                }
                None => scheduled.await,
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handles", &self.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gqlbind_cache::{gql, Client, MockTransport, MockTransportConfig};
    use serde_json::json;
    use std::time::Duration;

    fn client() -> Client {
        Client::new(
            MockTransport::new(MockTransportConfig::default().latency(Duration::ZERO))
                .resolver("GetTodoList", |_| Ok(json!({"todos": []}))),
        )
    }

    fn registry(client: &Client, grace: Duration) -> Arc<Registry> {
        Registry::for_adapter(client, RuntimeConfig::default().grace_period(grace))
    }

    fn vars(value: Value) -> Variables {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_query_key_is_canonical() {
        let a = query_key(FetchPolicy::CacheFirst, &vars(json!({"b": 1, "a": {"y": 2, "x": 1}})));
        let b = query_key(FetchPolicy::CacheFirst, &vars(json!({"a": {"x": 1, "y": 2}, "b": 1})));
        assert_eq!(a, b);
        assert_eq!(a, r#"cache-first:{"a":{"x":1,"y":2},"b":1}"#);
        assert_ne!(a, query_key(FetchPolicy::NetworkOnly, &vars(json!({"b": 1, "a": {"y": 2, "x": 1}}))));
    }

    #[test]
    fn test_deduplicates_handles() {
        let client = client();
        let registry = registry(&client, Duration::from_secs(5));
        let doc = gql("query GetTodoList { todos { id } }");
        let first = registry.get_or_create(&doc, &vars(json!({"a": 1, "b": 2})), FetchPolicy::CacheFirst);
        let second = registry.get_or_create(&doc, &vars(json!({"b": 2, "a": 1})), FetchPolicy::CacheFirst);
        let other = registry.get_or_create(&doc, &vars(json!({"a": 1, "b": 2})), FetchPolicy::NoCache);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_same_source_is_same_document() {
        let client = client();
        let registry = registry(&client, Duration::from_secs(5));
        let a = registry.get_or_create(&gql("query A { a }"), &Variables::new(), FetchPolicy::CacheFirst);
        let b = registry.get_or_create(&gql("query A { a }"), &Variables::new(), FetchPolicy::CacheFirst);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_expired() {
        let client = client();
        let registry = registry(&client, Duration::from_secs(5));
        let handle = registry.get_or_create(
            &gql("query GetTodoList { todos { id } }"),
            &Variables::new(),
            FetchPolicy::CacheFirst,
        );
        drop(handle.subscribe(Arc::new(|| {})));
        assert!(registry.next_disposal().is_some());

        assert_eq!(registry.dispose_expired(Instant::now()), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(registry.dispose_expired(Instant::now()), 1);
        assert!(!handle.is_live());
        // the entry survives disposal
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_disposals() {
        let client = client();
        let registry = registry(&client, Duration::from_secs(5));
        let driver = tokio::spawn(Arc::clone(&registry).drive_disposals());
        let handle = registry.get_or_create(
            &gql("query GetTodoList { todos { id } }"),
            &Variables::new(),
            FetchPolicy::CacheFirst,
        );
        drop(handle.subscribe(Arc::new(|| {})));
        assert!(handle.is_live());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!handle.is_live());
        assert!(registry.next_disposal().is_none());
        driver.abort();
    }

    #[test]
    fn test_one_registry_per_adapter() {
        let client = client();
        let first = registry(&client, Duration::from_secs(5));
        let second = Registry::for_adapter(&client.clone(), RuntimeConfig::default());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().grace_period, Duration::from_secs(5));

        let doc = gql("query GetTodoList { todos { id } }");
        let a = first.get_or_create(&doc, &Variables::new(), FetchPolicy::CacheFirst);
        let b = second.get_or_create(&doc, &Variables::new(), FetchPolicy::CacheFirst);
        assert!(Arc::ptr_eq(&a, &b));

        let other = Registry::for_adapter(&self::client(), RuntimeConfig::default());
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_foreign_slot_gets_detached_registry() {
        let client = client();
        assert!(client.slot().get_or_init(|| Arc::new(0_u32)).is_some());
        let first = registry(&client, Duration::from_secs(5));
        let second = registry(&client, Duration::from_secs(5));
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.adapter().is_ok());
    }

    #[test]
    fn test_adapter_dropped() {
        let registry = registry(&client(), Duration::from_secs(5));
        assert_eq!(registry.adapter().err(), Some(BindError::AdapterDropped));
    }
}
