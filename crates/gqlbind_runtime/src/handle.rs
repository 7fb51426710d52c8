//! Query handles.
//!
//! A [`QueryHandle`] wraps one live watch on the cache adapter and folds the
//! results it emits into a three-state machine:
//!
//! ```text
//!            first non-empty result
//!   Loading ───────────────────────▶ Resolved(data)
//!      ▲  └──────────────────────▶ Failed(error)
//!      │         error result
//!      └───── refetch(fresh) / disposal
//! ```
//!
//! The watch is opened lazily on first access. Once the last listener
//! unsubscribes, the handle schedules its own disposal one grace period
//! later; a new listener arriving first cancels it. Disposal closes the
//! watch and the next access starts over from the cache.

use gqlbind_cache::{
    deep_equal, is_empty_data, CacheAdapter, Document, FetchPolicy, OperationResult, QueryError,
    Variables, WatchQuery, WatchSubscription,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::disposal::{DisposalScheduler, TaskId};

/// Callback run whenever a handle changes state.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

pub(crate) type HandleScheduler = DisposalScheduler<Weak<QueryHandle>>;

type Settlement = Option<Result<Value, QueryError>>;

/// State of a query handle.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryStatus {
    /// No terminal result yet.
    Loading,
    /// The query produced data.
    Resolved(Value),
    /// The query failed.
    Failed(QueryError),
}

impl QueryStatus {
    /// Returns true while loading.
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// The data, if resolved.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Resolved(data) => Some(data),
            _ => None,
        }
    }

    /// The error, if failed.
    pub fn error(&self) -> Option<&QueryError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Settles with the first terminal result of a handle.
///
/// Any number of clones may wait on the same settlement.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<Settlement>,
}

impl Completion {
    fn new(rx: watch::Receiver<Settlement>) -> Self {
        Self { rx }
    }

    /// Returns true once a result is available.
    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Waits for the result.
    pub async fn wait(mut self) -> Result<Value, QueryError> {
        loop {
            let settled = self.rx.borrow_and_update().clone();
            if let Some(result) = settled {
                return result;
            }
            if self.rx.changed().await.is_err() {
                return Err(QueryError::cancelled("query handle was dropped"));
            }
        }
    }
}

struct Live {
    watch: Arc<dyn WatchQuery>,
    subscription: Option<WatchSubscription>,
}

struct HandleState {
    live: Option<Live>,
    status: QueryStatus,
    last_data: Option<Value>,
    completion: watch::Sender<Settlement>,
    listeners: Vec<(u64, Listener)>,
    next_listener: u64,
    disposal: Option<TaskId>,
    /// Bumped on disposal so results of a closed watch are dropped.
    generation: u64,
}

impl HandleState {
    fn new() -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            live: None,
            status: QueryStatus::Loading,
            last_data: None,
            completion,
            listeners: Vec::new(),
            next_listener: 0,
            disposal: None,
            generation: 0,
        }
    }

    fn listeners(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    fn settle(&mut self, result: Result<Value, QueryError>) {
        match &result {
            Ok(data) => {
                self.status = QueryStatus::Resolved(data.clone());
                self.last_data = Some(data.clone());
            }
            Err(err) => self.status = QueryStatus::Failed(err.clone()),
        }
        self.completion.send_replace(Some(result));
    }

    /// Starts a new, unsettled completion unless the current one is still
    /// pending.
    fn renew_completion(&mut self) {
        let settled = self.completion.borrow().is_some();
        if settled {
            self.completion = watch::channel(None).0;
        }
    }

    fn reset(&mut self) -> Option<Live> {
        self.generation += 1;
        self.listeners.clear();
        self.status = QueryStatus::Loading;
        self.last_data = None;
        let previous = std::mem::replace(&mut self.completion, watch::channel(None).0);
        if previous.borrow().is_none() {
            previous.send_replace(Some(Err(QueryError::cancelled("query handle disposed"))));
        }
        self.live.take()
    }
}

/// One deduplicated live query.
pub struct QueryHandle {
    this: Weak<QueryHandle>,
    adapter: Weak<dyn CacheAdapter>,
    document: Document,
    variables: Variables,
    fetch_policy: FetchPolicy,
    scheduler: Arc<HandleScheduler>,
    state: Mutex<HandleState>,
}

impl QueryHandle {
    pub(crate) fn new(
        adapter: Weak<dyn CacheAdapter>,
        document: Document,
        variables: Variables,
        fetch_policy: FetchPolicy,
        scheduler: Arc<HandleScheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            adapter,
            document,
            variables,
            fetch_policy,
            scheduler,
            state: Mutex::new(HandleState::new()),
        })
    }

    /// The document this handle watches.
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// The variables this handle watches.
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// The fetch policy of the watch.
    pub fn fetch_policy(&self) -> FetchPolicy {
        self.fetch_policy
    }

    /// Current state. Opens the watch if it is closed.
    pub fn status(&self) -> QueryStatus {
        self.ensure_live();
        self.state.lock().status.clone()
    }

    /// The completion of the current loading phase. Already settled when
    /// the handle is not loading.
    pub fn completion(&self) -> Completion {
        self.ensure_live();
        Completion::new(self.state.lock().completion.subscribe())
    }

    /// Returns true while the underlying watch is open.
    pub fn is_live(&self) -> bool {
        self.state.lock().live.is_some()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Returns true while a disposal is scheduled.
    pub fn disposal_pending(&self) -> bool {
        self.state.lock().disposal.is_some()
    }

    /// Registers a listener and cancels any scheduled disposal.
    pub fn subscribe(&self, listener: Listener) -> ListenerGuard {
        self.ensure_live();
        let mut state = self.state.lock();
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.push((id, listener));
        if let Some(task) = state.disposal.take() {
            self.scheduler.cancel(task);
            trace!(document = %self.document, "disposal cancelled");
        }
        ListenerGuard {
            handle: self.this.clone(),
            id,
            active: true,
        }
    }

    /// Re-executes the query.
    ///
    /// With `fresh`, the handle first drops back to `Loading` with a new
    /// completion and notifies its listeners; only then is the refetch
    /// issued. The returned completion settles with the refetch result.
    /// Must be called within a Tokio runtime.
    pub fn refetch(&self, fresh: bool) -> Completion {
        self.ensure_live();
        let (tx, rx) = watch::channel(None);
        let (watch, generation, listeners) = {
            let mut state = self.state.lock();
            let Some(watch) = state.live.as_ref().map(|live| Arc::clone(&live.watch)) else {
                tx.send_replace(Some(Err(QueryError::cancelled("query handle disposed"))));
                return Completion::new(rx);
            };
            let listeners = if fresh {
                state.status = QueryStatus::Loading;
                state.last_data = None;
                state.renew_completion();
                state.listeners()
            } else {
                Vec::new()
            };
            (watch, state.generation, listeners)
        };

        for listener in listeners {
            listener();
        }

        debug!(document = %self.document, fresh, "refetch");
        let pending = watch.refetch();
        let this = self.this.clone();
        tokio::spawn(async move {
            let outcome = pending.await;
            let result = match this.upgrade() {
                Some(handle) => handle.apply_refetch(generation, outcome),
                None => flatten(outcome),
            };
            tx.send_replace(Some(result));
        });
        Completion::new(rx)
    }

    /// Closes the watch and drops every listener now.
    pub fn dispose(&self) {
        let live = {
            let mut state = self.state.lock();
            if let Some(task) = state.disposal.take() {
                self.scheduler.cancel(task);
            }
            state.reset()
        };
        if live.is_some() {
            debug!(document = %self.document, "query handle disposed");
        }
    }

    /// Runs a scheduled disposal if it is still the current one.
    pub(crate) fn dispose_scheduled(&self, task: TaskId) -> bool {
        let live = {
            let mut state = self.state.lock();
            if state.disposal != Some(task) || !state.listeners.is_empty() {
                return false;
            }
            state.disposal = None;
            state.reset()
        };
        debug!(document = %self.document, "idle query handle disposed");
        drop(live);
        true
    }

    fn remove_listener(&self, id: u64) {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        if state.listeners.len() == before || !state.listeners.is_empty() {
            return;
        }
        if let Some(task) = state.disposal.take() {
            self.scheduler.cancel(task);
        }
        state.disposal = Some(self.scheduler.schedule(self.this.clone()));
        trace!(
            document = %self.document,
            grace_ms = self.scheduler.grace_period().as_millis() as u64,
            "last listener left, disposal scheduled"
        );
    }

    fn ensure_live(&self) {
        let generation = {
            let state = self.state.lock();
            if state.live.is_some() {
                return;
            }
            state.generation
        };

        let Some(adapter) = self.adapter.upgrade() else {
            let mut state = self.state.lock();
            if state.generation == generation && state.status.error().is_none() {
                state.settle(Err(QueryError::cancelled("cache adapter dropped")));
            }
            return;
        };
        let watch = adapter.watch(&self.document, &self.variables, self.fetch_policy);
        let seed = if self.fetch_policy.bypasses_cache() {
            None
        } else {
            watch.last_result().filter(|result| !result.loading)
        };

        {
            let mut state = self.state.lock();
            if state.live.is_some() || state.generation != generation {
                return;
            }
            match seed {
                Some(OperationResult {
                    error: Some(err), ..
                }) => state.settle(Err(err)),
                Some(OperationResult {
                    data: Some(data), ..
                }) if !is_empty_data(Some(&data)) => state.settle(Ok(data)),
                _ => {}
            }
            trace!(document = %self.document, status = ?state.status, "watch opened");
            state.live = Some(Live {
                watch: Arc::clone(&watch),
                subscription: None,
            });
        }

        let this = self.this.clone();
        let subscription = watch.subscribe(Arc::new(move |result: &OperationResult| {
            if let Some(handle) = this.upgrade() {
                handle.on_result(generation, result);
            }
        }));

        let mut state = self.state.lock();
        if state.generation == generation {
            if let Some(live) = state.live.as_mut() {
                live.subscription = Some(subscription);
                return;
            }
        }
        drop(state);
        drop(subscription);
    }

    fn on_result(&self, generation: u64, result: &OperationResult) {
        if result.loading {
            return;
        }
        let listeners = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            if let Some(err) = &result.error {
                debug!(document = %self.document, error = %err, "query failed");
                state.settle(Err(err.clone()));
            } else {
                let Some(data) = result.data.as_ref() else {
                    return;
                };
                if is_empty_data(Some(data))
                    || state.last_data.as_ref().is_some_and(|last| deep_equal(last, data))
                {
                    return;
                }
                trace!(document = %self.document, "query resolved");
                state.settle(Ok(data.clone()));
            }
            state.listeners()
        };
        for listener in listeners {
            listener();
        }
    }

    fn apply_refetch(
        &self,
        generation: u64,
        outcome: Result<OperationResult, QueryError>,
    ) -> Result<Value, QueryError> {
        let result = match outcome {
            Ok(OperationResult {
                data: Some(data),
                error: None,
                ..
            }) if !is_empty_data(Some(&data)) => Ok(data),
            Ok(OperationResult {
                error: Some(err), ..
            })
            | Err(err) => Err(err),
            Ok(_) => Err(QueryError::no_data(&self.document)),
        };

        let listeners = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return result;
            }
            state.settle(result.clone());
            state.listeners()
        };
        for listener in listeners {
            listener();
        }
        result
    }
}

fn flatten(outcome: Result<OperationResult, QueryError>) -> Result<Value, QueryError> {
    let result = outcome?;
    match (result.error, result.data) {
        (Some(err), _) => Err(err),
        (None, Some(data)) => Ok(data),
        (None, None) => Err(QueryError::cancelled("query handle dropped")),
    }
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("QueryHandle")
            .field("document", &self.document)
            .field("fetch_policy", &self.fetch_policy)
            .field("status", &state.status)
            .field("listeners", &state.listeners.len())
            .field("live", &state.live.is_some())
            .finish_non_exhaustive()
    }
}

/// Unsubscribes a listener from a [`QueryHandle`] when dropped.
#[must_use = "dropping a ListenerGuard unsubscribes immediately"]
pub struct ListenerGuard {
    handle: Weak<QueryHandle>,
    id: u64,
    active: bool,
}

impl ListenerGuard {
    /// Unsubscribes. Calling it again does nothing.
    pub fn unsubscribe(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(handle) = self.handle.upgrade() {
            handle.remove_listener(self.id);
        }
    }

    /// Returns true if this guard belongs to `handle`.
    pub fn is_for(&self, handle: &Arc<QueryHandle>) -> bool {
        std::ptr::eq(self.handle.as_ptr(), Arc::as_ptr(handle))
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
