//! The cache adapter contract consumed by the binding runtime.

use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};

use crate::document::{Document, FetchPolicy, Variables};
use crate::error::QueryError;
use crate::normalize::EntityId;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Computes the next value of one entity field from its previous value.
pub type FieldModifier = Box<dyn FnOnce(&Value) -> Value + Send>;

/// Field modifiers applied by [`CacheAdapter::modify`], keyed by field name.
pub type FieldModifiers = Vec<(String, FieldModifier)>;

/// Callback receiving every result a [`WatchQuery`] emits.
pub type Observer = Arc<dyn Fn(&OperationResult) + Send + Sync>;

/// One status of a watched query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationResult {
    /// Result data, if any.
    pub data: Option<Value>,
    /// Failure, if the operation failed.
    pub error: Option<QueryError>,
    /// True while a request for this query is in flight.
    pub loading: bool,
}

impl OperationResult {
    /// A settled result carrying data.
    pub fn ready(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
            loading: false,
        }
    }

    /// A settled failure.
    pub fn failed(error: QueryError) -> Self {
        Self {
            data: None,
            error: Some(error),
            loading: false,
        }
    }

    /// An in-flight status, optionally carrying the previous data.
    pub fn loading(previous: Option<Value>) -> Self {
        Self {
            data: previous,
            error: None,
            loading: true,
        }
    }
}

/// Subscription to a [`WatchQuery`]. Unsubscribes when dropped.
#[must_use = "dropping a WatchSubscription unsubscribes immediately"]
pub struct WatchSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchSubscription {
    /// Creates a subscription running `cancel` on unsubscribe.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancels the subscription.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A live query against the cache and the transport behind it.
///
/// Emits a result on every status change: loading, data arriving from the
/// network, data changing in the cache, failure.
pub trait WatchQuery: Send + Sync {
    /// The effective fetch policy.
    fn fetch_policy(&self) -> FetchPolicy;

    /// The last known result, if there is one.
    fn last_result(&self) -> Option<OperationResult>;

    /// Registers an observer. The first observer activates the query.
    fn subscribe(&self, observer: Observer) -> WatchSubscription;

    /// Re-executes the query against the transport.
    ///
    /// The settled result is returned to the caller rather than emitted.
    fn refetch(&self) -> BoxFuture<'static, Result<OperationResult, QueryError>>;
}

/// State a runtime attaches to one adapter instance.
///
/// The slot lives as long as the adapter and is filled at most once. It
/// also carries a weak reference to its adapter, so whatever is stored in it
/// can reach the adapter without keeping it alive.
pub struct AdapterSlot {
    owner: Weak<dyn CacheAdapter>,
    value: OnceLock<Arc<dyn Any + Send + Sync>>,
}

impl AdapterSlot {
    /// Creates an empty slot for the adapter behind `owner`.
    pub fn new(owner: Weak<dyn CacheAdapter>) -> Self {
        Self {
            owner,
            value: OnceLock::new(),
        }
    }

    /// The adapter owning this slot.
    pub fn owner(&self) -> Weak<dyn CacheAdapter> {
        Weak::clone(&self.owner)
    }

    /// Returns the stored value, storing `init()` first if the slot is
    /// empty. Returns `None` if the slot holds a value of another type.
    pub fn get_or_init<T: Any + Send + Sync>(&self, init: impl FnOnce() -> Arc<T>) -> Option<Arc<T>> {
        let value = self
            .value
            .get_or_init(|| init() as Arc<dyn Any + Send + Sync>);
        Arc::clone(value).downcast::<T>().ok()
    }

    /// Returns true once a value was stored.
    pub fn is_filled(&self) -> bool {
        self.value.get().is_some()
    }
}

impl fmt::Debug for AdapterSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSlot")
            .field("filled", &self.is_filled())
            .finish_non_exhaustive()
    }
}

/// A normalized object cache.
///
/// Every mutation is synchronous and immediately visible to subscribed
/// [`WatchQuery`] observers.
pub trait CacheAdapter: Send + Sync {
    /// Reads a complete answer for `document` from the cache.
    fn read_query(&self, document: &Document, variables: &Variables) -> Option<Value>;

    /// Writes an answer for `document` into the cache.
    fn write_query(&self, document: &Document, variables: &Variables, data: Value);

    /// Forgets the stored answer for `document`. Entity records are kept.
    fn remove_query(&self, document: &Document, variables: &Variables) -> bool;

    /// Applies field modifiers to an entity record. Modifiers of fields the
    /// record does not hold are not called.
    fn modify(&self, id: &EntityId, modifiers: FieldModifiers) -> bool;

    /// Removes an entity record.
    fn evict(&self, id: &EntityId) -> bool;

    /// Computes the identity of an entity object.
    fn identify(&self, entity: &Value) -> Option<EntityId>;

    /// Opens a live query.
    fn watch(
        &self,
        document: &Document,
        variables: &Variables,
        fetch_policy: FetchPolicy,
    ) -> Arc<dyn WatchQuery>;

    /// Per-instance storage for the runtime bound to this adapter.
    fn slot(&self) -> &AdapterSlot;
}
