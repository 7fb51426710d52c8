//! A cache adapter backed by [`InMemoryCache`] and a [`Transport`].
//!
//! [`Client`] owns the cache and the set of live [`ObservableQuery`]s. Every
//! cache mutation made through the client is broadcast: each active watch
//! re-reads its answer and emits when the answer changed. A watch whose
//! answer became incomplete (an entity it references was evicted) fetches
//! it again when its policy allows the network.
//!
//! Network requests run on Tokio tasks, so watches must be subscribed from
//! within a Tokio runtime.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::adapter::{
    AdapterSlot, BoxFuture, CacheAdapter, FieldModifiers, Observer, OperationResult, WatchQuery,
    WatchSubscription,
};
use crate::cache::InMemoryCache;
use crate::canonical::deep_equal;
use crate::document::{Document, FetchPolicy, Variables};
use crate::error::QueryError;
use crate::normalize::{identify, EntityId};
use crate::transport::{Request, Transport};

/// GraphQL client: normalized cache, transport and live queries.
///
/// Clones share one cache, one set of watches and one [`AdapterSlot`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    this: Weak<ClientInner>,
    cache: InMemoryCache,
    transport: Arc<dyn Transport>,
    watches: Mutex<Vec<Weak<WatchInner>>>,
    slot: AdapterSlot,
}

impl Client {
    /// Creates a client over `transport` with an empty cache.
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self::with_transport(Arc::new(transport))
    }

    /// Creates a client over a shared transport.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new_cyclic(|this: &Weak<ClientInner>| ClientInner {
                this: Weak::clone(this),
                cache: InMemoryCache::new(),
                transport,
                watches: Mutex::new(Vec::new()),
                slot: AdapterSlot::new(Weak::clone(this) as Weak<dyn CacheAdapter>),
            }),
        }
    }

    /// The underlying cache. Writes made directly on it are not broadcast.
    pub fn cache(&self) -> &InMemoryCache {
        &self.inner.cache
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Executes a mutation and merges the entities it returns into the cache.
    pub async fn mutate(
        &self,
        document: &Document,
        variables: Variables,
    ) -> Result<Value, QueryError> {
        let data = self
            .inner
            .transport
            .execute(Request::new(document.clone(), variables))
            .await?;
        debug!(%document, "mutation settled");
        self.inner.cache.write_entities(&data);
        self.inner.broadcast(None);
        Ok(data)
    }

    /// Number of watches with at least one observer.
    pub fn active_watches(&self) -> usize {
        self.inner
            .live_watches()
            .iter()
            .filter(|w| w.is_active())
            .count()
    }
}

impl ClientInner {
    fn live_watches(&self) -> Vec<Arc<WatchInner>> {
        let mut watches = self.watches.lock();
        watches.retain(|w| w.strong_count() > 0);
        watches.iter().filter_map(Weak::upgrade).collect()
    }

    fn broadcast(&self, except: Option<&Arc<WatchInner>>) {
        for watch in self.live_watches() {
            if except.is_some_and(|e| Arc::ptr_eq(e, &watch)) {
                continue;
            }
            watch.on_cache_changed(self);
        }
    }
}

impl CacheAdapter for ClientInner {
    fn read_query(&self, document: &Document, variables: &Variables) -> Option<Value> {
        self.cache.read_query(document, variables)
    }

    fn write_query(&self, document: &Document, variables: &Variables, data: Value) {
        self.cache.write_query(document, variables, &data);
        self.broadcast(None);
    }

    fn remove_query(&self, document: &Document, variables: &Variables) -> bool {
        let removed = self.cache.remove_query(document, variables);
        if removed {
            self.broadcast(None);
        }
        removed
    }

    fn modify(&self, id: &EntityId, modifiers: FieldModifiers) -> bool {
        let changed = self.cache.modify(id, modifiers);
        if changed {
            self.broadcast(None);
        }
        changed
    }

    fn evict(&self, id: &EntityId) -> bool {
        let evicted = self.cache.evict(id);
        if evicted {
            debug!(entity = %id, "evicted");
            self.broadcast(None);
        }
        evicted
    }

    fn identify(&self, entity: &Value) -> Option<EntityId> {
        identify(entity)
    }

    fn watch(
        &self,
        document: &Document,
        variables: &Variables,
        fetch_policy: FetchPolicy,
    ) -> Arc<dyn WatchQuery> {
        let inner = Arc::new(WatchInner {
            document: document.clone(),
            variables: variables.clone(),
            fetch_policy,
            state: Mutex::new(WatchState::default()),
        });
        self.watches.lock().push(Arc::downgrade(&inner));
        trace!(%document, %fetch_policy, "watch opened");
        Arc::new(ObservableQuery {
            inner,
            client: Weak::clone(&self.this),
        })
    }

    fn slot(&self) -> &AdapterSlot {
        &self.slot
    }
}

impl CacheAdapter for Client {
    fn read_query(&self, document: &Document, variables: &Variables) -> Option<Value> {
        self.inner.read_query(document, variables)
    }

    fn write_query(&self, document: &Document, variables: &Variables, data: Value) {
        self.inner.write_query(document, variables, data);
    }

    fn remove_query(&self, document: &Document, variables: &Variables) -> bool {
        self.inner.remove_query(document, variables)
    }

    fn modify(&self, id: &EntityId, modifiers: FieldModifiers) -> bool {
        self.inner.modify(id, modifiers)
    }

    fn evict(&self, id: &EntityId) -> bool {
        self.inner.evict(id)
    }

    fn identify(&self, entity: &Value) -> Option<EntityId> {
        identify(entity)
    }

    fn watch(
        &self,
        document: &Document,
        variables: &Variables,
        fetch_policy: FetchPolicy,
    ) -> Arc<dyn WatchQuery> {
        self.inner.watch(document, variables, fetch_policy)
    }

    fn slot(&self) -> &AdapterSlot {
        &self.inner.slot
    }
}

/// A live query opened by [`Client::watch`](CacheAdapter::watch).
///
/// Holds its client weakly: once every [`Client`] clone is dropped, the
/// query stops fetching.
pub struct ObservableQuery {
    inner: Arc<WatchInner>,
    client: Weak<ClientInner>,
}

struct WatchInner {
    document: Document,
    variables: Variables,
    fetch_policy: FetchPolicy,
    state: Mutex<WatchState>,
}

#[derive(Default)]
struct WatchState {
    observers: Vec<(u64, Observer)>,
    next_observer: u64,
    last: Option<OperationResult>,
    /// Number of the newest request. Responses to older ones are dropped.
    issued: u64,
    /// Requests not settled yet.
    pending: usize,
}

impl WatchInner {
    fn is_active(&self) -> bool {
        !self.state.lock().observers.is_empty()
    }

    fn observers(&self) -> Vec<Observer> {
        self.state
            .lock()
            .observers
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect()
    }

    fn emit(&self, result: &OperationResult, observers: Vec<Observer>) {
        for observer in observers {
            observer(result);
        }
    }

    fn remove_observer(&self, id: u64) {
        let mut state = self.state.lock();
        state.observers.retain(|(oid, _)| *oid != id);
        if state.observers.is_empty() {
            trace!(document = %self.document, "watch idle");
        }
    }

    /// Registers a request and returns its number with the data to show
    /// while it runs.
    fn begin_request(&self) -> (u64, Option<Value>) {
        let mut state = self.state.lock();
        state.issued += 1;
        state.pending += 1;
        (state.issued, state.last.as_ref().and_then(|r| r.data.clone()))
    }

    fn activate(self: &Arc<Self>, client: &ClientInner) {
        let cached = if self.fetch_policy.bypasses_cache() {
            None
        } else {
            client.cache.read_query(&self.document, &self.variables)
        };
        let fetch = match self.fetch_policy {
            FetchPolicy::CacheFirst => cached.is_none(),
            FetchPolicy::CacheAndNetwork | FetchPolicy::NetworkOnly | FetchPolicy::NoCache => true,
            FetchPolicy::CacheOnly | FetchPolicy::Standby => false,
        };
        if let Some(data) = cached {
            self.state.lock().last = Some(OperationResult::ready(data));
        }
        if fetch {
            self.start_fetch(client);
        }
    }

    fn on_cache_changed(self: &Arc<Self>, client: &ClientInner) {
        if !self.fetch_policy.observes_cache() {
            return;
        }
        let in_flight = {
            let state = self.state.lock();
            // A bypassing watch shows nothing from the cache before its
            // first network result.
            if state.observers.is_empty()
                || (self.fetch_policy.bypasses_cache() && state.last.is_none())
            {
                return;
            }
            state.pending > 0
        };

        match client.cache.read_query(&self.document, &self.variables) {
            Some(data) => {
                let observers = {
                    let mut state = self.state.lock();
                    let unchanged = state
                        .last
                        .as_ref()
                        .and_then(|r| r.data.as_ref())
                        .is_some_and(|last| deep_equal(last, &data));
                    if unchanged {
                        return;
                    }
                    state.last = Some(OperationResult::ready(data.clone()));
                    state.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
                };
                self.emit(&OperationResult::ready(data), observers);
            }
            None => {
                let refill = matches!(
                    self.fetch_policy,
                    FetchPolicy::CacheFirst | FetchPolicy::CacheAndNetwork
                );
                if refill && !in_flight {
                    debug!(document = %self.document, "answer incomplete, fetching");
                    self.start_fetch(client);
                }
            }
        }
    }

    fn start_fetch(self: &Arc<Self>, client: &ClientInner) {
        let Some(client) = client.this.upgrade() else {
            return;
        };
        if self.state.lock().pending > 0 {
            return;
        }
        let (request, previous) = self.begin_request();

        let watch = Arc::clone(self);
        tokio::spawn(async move {
            watch.emit(&OperationResult::loading(previous), watch.observers());
            let outcome = client
                .transport
                .execute(Request::new(watch.document.clone(), watch.variables.clone()))
                .await;
            if let Some(result) = watch.settle(&client, request, outcome) {
                watch.emit(&result, watch.observers());
            }
        });
    }

    /// Stores a network outcome and returns the result to deliver, or `None`
    /// if a newer request superseded this one.
    fn settle(
        self: &Arc<Self>,
        client: &ClientInner,
        request: u64,
        outcome: Result<Value, QueryError>,
    ) -> Option<OperationResult> {
        {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
            if request != state.issued {
                trace!(document = %self.document, request, "superseded response dropped");
                return None;
            }
        }

        let result = match outcome {
            Ok(data) if self.fetch_policy.writes_cache() => {
                client.cache.write_query(&self.document, &self.variables, &data);
                {
                    // The write must not echo back to this watch.
                    let mut state = self.state.lock();
                    state.last = Some(OperationResult::ready(data.clone()));
                }
                client.broadcast(Some(self));
                let stored = client.cache.read_query(&self.document, &self.variables);
                OperationResult::ready(stored.unwrap_or(data))
            }
            Ok(data) => OperationResult::ready(data),
            Err(error) => {
                warn!(document = %self.document, %error, "query failed");
                OperationResult::failed(error)
            }
        };

        self.state.lock().last = Some(result.clone());
        Some(result)
    }
}

impl WatchQuery for ObservableQuery {
    fn fetch_policy(&self) -> FetchPolicy {
        self.inner.fetch_policy
    }

    fn last_result(&self) -> Option<OperationResult> {
        if !self.inner.fetch_policy.bypasses_cache() {
            let cached = self.client.upgrade().and_then(|client| {
                client
                    .cache
                    .read_query(&self.inner.document, &self.inner.variables)
            });
            if let Some(data) = cached {
                return Some(OperationResult::ready(data));
            }
        }
        self.inner.state.lock().last.clone()
    }

    fn subscribe(&self, observer: Observer) -> WatchSubscription {
        let (id, first) = {
            let mut state = self.inner.state.lock();
            let id = state.next_observer;
            state.next_observer += 1;
            state.observers.push((id, observer));
            (id, state.observers.len() == 1)
        };
        if first {
            if let Some(client) = self.client.upgrade() {
                self.inner.activate(&client);
            }
        }
        let inner = Arc::downgrade(&self.inner);
        WatchSubscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove_observer(id);
            }
        })
    }

    fn refetch(&self) -> BoxFuture<'static, Result<OperationResult, QueryError>> {
        let watch = Arc::clone(&self.inner);
        let client = self.client.upgrade();
        Box::pin(async move {
            let client = client.ok_or_else(|| QueryError::cancelled("client dropped"))?;
            let (request, previous) = watch.begin_request();
            watch.emit(&OperationResult::loading(previous), watch.observers());
            debug!(document = %watch.document, request, "refetch");
            let outcome = client
                .transport
                .execute(Request::new(watch.document.clone(), watch.variables.clone()))
                .await;
            match (watch.settle(&client, request, outcome.clone()), outcome) {
                (_, Err(error)) => Err(error),
                (Some(result), Ok(_)) => Ok(result),
                (None, Ok(data)) => Ok(OperationResult::ready(data)),
            }
        })
    }
}
