//! Query orchestrator.
//!
//! One [`Orchestrator`] serves one binding session. It resolves named
//! definitions to registry handles, answers render-phase reads
//! synchronously or suspends them, and drives the imperative operations:
//! optimistic writes with rollback, eviction, refetch and preload.

use gqlbind_cache::{BoxFuture, FieldModifier, Variables};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::definition::{Definitions, QueryArg, QueryDefinition};
use crate::error::{BindError, BindResult};
use crate::handle::{Completion, Listener, ListenerGuard, QueryHandle, QueryStatus};
use crate::registry::Registry;
use crate::resolution::{PendingSet, Resolution};
use crate::session::RenderPhase;

/// Replacement for a whole query answer.
pub enum Update {
    /// Write this value.
    Replace(Value),
    /// Compute the value from the cached one. `None` skips the write.
    With(Box<dyn FnOnce(Option<&Value>) -> Option<Value> + Send>),
}

impl Update {
    /// Writes `value` as is.
    pub fn replace(value: Value) -> Self {
        Self::Replace(value)
    }

    /// Derives the answer from the cached one, if any.
    pub fn with<F>(f: F) -> Self
    where
        F: FnOnce(Option<&Value>) -> Option<Value> + Send + 'static,
    {
        Self::With(Box::new(f))
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace(value) => f.debug_tuple("Replace").field(value).finish(),
            Self::With(_) => f.write_str("With(..)"),
        }
    }
}

/// Change to one entity field.
pub enum FieldUpdate {
    /// Set the field to this value.
    Set(Value),
    /// Compute the field from its previous value.
    With(FieldModifier),
}

impl FieldUpdate {
    /// Sets the field to `value`.
    pub fn set(value: impl Into<Value>) -> Self {
        Self::Set(value.into())
    }

    /// Maps the previous field value to the next one.
    pub fn with<F>(f: F) -> Self
    where
        F: FnOnce(&Value) -> Value + Send + 'static,
    {
        Self::With(Box::new(f))
    }

    fn apply(self, previous: &Value) -> Value {
        match self {
            Self::Set(value) => value,
            Self::With(f) => f(previous),
        }
    }
}

impl fmt::Debug for FieldUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set(value) => f.debug_tuple("Set").field(value).finish(),
            Self::With(_) => f.write_str("With(..)"),
        }
    }
}

/// Field changes applied by [`Orchestrator::write_entity`].
pub type FieldChanges = Vec<(String, FieldUpdate)>;

/// Restores the cache state captured before a write.
#[derive(Clone)]
pub struct Rollback {
    restore: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Rollback {
    /// A rollback that does nothing, returned for writes that were skipped.
    pub fn noop() -> Self {
        Self { restore: None }
    }

    fn new(restore: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            restore: Some(Arc::new(restore)),
        }
    }

    /// Returns true if the write was skipped.
    pub fn is_noop(&self) -> bool {
        self.restore.is_none()
    }

    /// Re-applies the captured state. Running it twice has no further effect.
    pub fn run(&self) {
        if let Some(restore) = &self.restore {
            restore();
        }
    }
}

impl fmt::Debug for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rollback")
            .field("noop", &self.is_noop())
            .finish()
    }
}

/// Selects used queries for [`Orchestrator::refetch`].
#[derive(Clone)]
pub enum RefetchTarget {
    /// Every used query.
    All,
    /// Used queries bound to this definition key.
    Key(String),
    /// Used queries bound to any of these keys.
    Keys(Vec<String>),
    /// Used queries for which the predicate over (key, variables) holds.
    Filter(Arc<dyn Fn(&str, &Variables) -> bool + Send + Sync>),
}

impl RefetchTarget {
    /// Selects used queries matching `f`.
    pub fn filter<F>(f: F) -> Self
    where
        F: Fn(&str, &Variables) -> bool + Send + Sync + 'static,
    {
        Self::Filter(Arc::new(f))
    }

    fn matches(&self, key: &str, variables: &Variables) -> bool {
        match self {
            Self::All => true,
            Self::Key(k) => k == key,
            Self::Keys(keys) => keys.iter().any(|k| k == key),
            Self::Filter(f) => f(key, variables),
        }
    }
}

impl From<&str> for RefetchTarget {
    fn from(key: &str) -> Self {
        Self::Key(key.to_owned())
    }
}

impl fmt::Debug for RefetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Self::Keys(keys) => f.debug_tuple("Keys").field(keys).finish(),
            Self::Filter(_) => f.write_str("Filter(..)"),
        }
    }
}

struct UsedQuery {
    key: String,
    variables: Variables,
    handle: Arc<QueryHandle>,
}

enum Slot {
    Ready(Value),
    Waiting(Completion),
}

struct Resolved {
    slots: Vec<Slot>,
    subscribe: Vec<Arc<QueryHandle>>,
    memoize: Vec<Option<String>>,
}

/// Per-session query façade.
pub struct Orchestrator {
    registry: Arc<Registry>,
    phase: Arc<RenderPhase>,
    definitions: RwLock<Definitions>,
    on_update: Listener,
    used: Mutex<Vec<UsedQuery>>,
    memo: Mutex<FxHashMap<String, Value>>,
    guards: Mutex<Vec<ListenerGuard>>,
}

impl Orchestrator {
    /// Creates an orchestrator. `on_update` is subscribed to every handle a
    /// successful [`get`](Self::get) reads.
    pub fn new(registry: Arc<Registry>, phase: Arc<RenderPhase>, on_update: Listener) -> Self {
        Self {
            registry,
            phase,
            definitions: RwLock::new(Definitions::new()),
            on_update,
            used: Mutex::new(Vec::new()),
            memo: Mutex::new(FxHashMap::default()),
            guards: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Replaces the definition set.
    pub fn set_definitions(&self, definitions: Definitions) {
        *self.definitions.write() = definitions;
    }

    /// Number of queries recorded as used.
    pub fn used_count(&self) -> usize {
        self.used.lock().len()
    }

    /// Number of active change subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.guards.lock().len()
    }

    /// Reads queries during the render phase.
    ///
    /// Fails on the first failed query. Suspends with [`Resolution::Pending`]
    /// while any query is loading. Once every query is ready, subscribes the
    /// update listener to them and returns their data in argument order.
    pub fn get(&self, args: &[QueryArg]) -> BindResult<Resolution<Vec<Value>>> {
        self.ensure_rendering("get")?;
        let resolved = self.resolve(args, true)?;

        let mut values = Vec::with_capacity(resolved.slots.len());
        let mut pending = Vec::new();
        for slot in resolved.slots {
            match slot {
                Slot::Ready(value) => values.push(value),
                Slot::Waiting(completion) => pending.push(completion),
            }
        }
        if !pending.is_empty() {
            trace!(pending = pending.len(), "render suspended");
            return Ok(Resolution::Pending(PendingSet::new(pending)));
        }

        {
            let mut guards = self.guards.lock();
            for handle in resolved.subscribe {
                if !guards.iter().any(|g| g.is_for(&handle)) {
                    guards.push(handle.subscribe(Arc::clone(&self.on_update)));
                }
            }
        }
        {
            let mut memo = self.memo.lock();
            for (key, value) in resolved.memoize.iter().zip(&values) {
                if let Some(key) = key {
                    memo.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(Resolution::Ready(values))
    }

    /// Resolves like [`get`](Self::get) without subscribing, waiting for
    /// loading queries. Valid at any time.
    pub fn peek(&self, args: &[QueryArg]) -> BoxFuture<'static, BindResult<Vec<Value>>> {
        let resolved = self.resolve(args, false);
        Box::pin(async move {
            let mut values = Vec::new();
            for slot in resolved?.slots {
                match slot {
                    Slot::Ready(value) => values.push(value),
                    Slot::Waiting(completion) => values.push(completion.wait().await?),
                }
            }
            Ok(values)
        })
    }

    /// Reads answers straight from the cache.
    pub fn read(&self, args: &[QueryArg]) -> BindResult<Vec<Option<Value>>> {
        args.iter()
            .map(|arg| {
                let definition = self.definition(arg.name(), arg.overrides())?;
                Ok(self
                    .registry
                    .adapter()?
                    .read_query(&definition.document, &definition.variables))
            })
            .collect()
    }

    /// Writes a query answer into the cache.
    ///
    /// The returned rollback restores the answer cached before the write, or
    /// removes the answer if there was none.
    pub fn write(
        &self,
        key: &str,
        update: Update,
        overrides: Option<&Variables>,
    ) -> BindResult<Rollback> {
        let definition = self.definition(key, overrides)?;
        let adapter = self.registry.adapter()?;
        let document = definition.document;
        let variables = definition.variables;
        let previous = adapter.read_query(&document, &variables);

        let next = match update {
            Update::Replace(value) => Some(value),
            Update::With(f) => f(previous.as_ref()),
        };
        let Some(next) = next else {
            trace!(key, "write skipped");
            return Ok(Rollback::noop());
        };

        debug!(key, %document, "write");
        adapter.write_query(&document, &variables, next);
        Ok(Rollback::new(move || match &previous {
            Some(data) => adapter.write_query(&document, &variables, data.clone()),
            None => {
                adapter.remove_query(&document, &variables);
            }
        }))
    }

    /// Changes fields of a normalized entity.
    ///
    /// The rollback writes back the values the fields held before.
    pub fn write_entity(&self, entity: &Value, changes: FieldChanges) -> BindResult<Rollback> {
        let adapter = self.registry.adapter()?;
        let id = adapter
            .identify(entity)
            .ok_or_else(|| unidentified(entity))?;

        let captured = Arc::new(Mutex::new(Vec::new()));
        let modifiers = changes
            .into_iter()
            .map(|(field, update)| {
                let captured = Arc::clone(&captured);
                let name = field.clone();
                let modifier: FieldModifier = Box::new(move |previous: &Value| {
                    captured.lock().push((name, previous.clone()));
                    update.apply(previous)
                });
                (field, modifier)
            })
            .collect();
        adapter.modify(&id, modifiers);

        let previous: Vec<(String, Value)> = std::mem::take(&mut *captured.lock());
        if previous.is_empty() {
            return Ok(Rollback::noop());
        }
        debug!(entity = %id, fields = previous.len(), "entity written");
        Ok(Rollback::new(move || {
            let modifiers = previous
                .iter()
                .map(|(field, value)| {
                    let value = value.clone();
                    let modifier: FieldModifier = Box::new(move |_: &Value| value);
                    (field.clone(), modifier)
                })
                .collect();
            adapter.modify(&id, modifiers);
        }))
    }

    /// Removes an entity from the cache. Returns false if it was not cached.
    pub fn evict(&self, entity: &Value) -> BindResult<bool> {
        let adapter = self.registry.adapter()?;
        let id = adapter
            .identify(entity)
            .ok_or_else(|| unidentified(entity))?;
        let evicted = adapter.evict(&id);
        debug!(entity = %id, evicted, "evict");
        Ok(evicted)
    }

    /// Refetches the used queries selected by `target`. The returned set
    /// settles once every refetch finished.
    pub fn refetch(&self, target: &RefetchTarget, fresh: bool) -> PendingSet {
        let handles: Vec<Arc<QueryHandle>> = {
            let used = self.used.lock();
            let mut handles: Vec<Arc<QueryHandle>> = Vec::new();
            for query in used.iter() {
                if target.matches(&query.key, &query.variables)
                    && !handles.iter().any(|h| Arc::ptr_eq(h, &query.handle))
                {
                    handles.push(Arc::clone(&query.handle));
                }
            }
            handles
        };
        debug!(?target, fresh, queries = handles.len(), "refetch");
        PendingSet::new(handles.iter().map(|h| h.refetch(fresh)).collect())
    }

    /// Starts loading queries without subscribing to them or recording them
    /// as used.
    pub fn preload(&self, keys: &[&str]) -> BindResult<BoxFuture<'static, BindResult<()>>> {
        let completions = keys
            .iter()
            .map(|key| {
                let definition = self.definition(key, None)?;
                Ok(self.registry.handle_for(&definition).completion())
            })
            .collect::<BindResult<Vec<_>>>()?;
        Ok(Box::pin(async move {
            PendingSet::new(completions).wait_all().await?;
            Ok(())
        }))
    }

    /// Drops the result memo and every change subscription of this session.
    pub fn cleanup(&self) {
        self.memo.lock().clear();
        let guards = std::mem::take(&mut *self.guards.lock());
        if !guards.is_empty() {
            trace!(subscriptions = guards.len(), "unsubscribing");
        }
        drop(guards);
    }

    fn ensure_rendering(&self, operation: &'static str) -> BindResult<()> {
        if self.phase.is_rendering() {
            Ok(())
        } else {
            Err(BindError::CapabilityViolation { operation })
        }
    }

    fn definition(&self, key: &str, overrides: Option<&Variables>) -> BindResult<QueryDefinition> {
        let definitions = self.definitions.read();
        let definition = definitions
            .get(key)
            .ok_or_else(|| BindError::unknown_definition(key))?;
        Ok(match overrides {
            Some(overrides) => definition.with_overrides(overrides),
            None => definition.clone(),
        })
    }

    fn resolve(&self, args: &[QueryArg], record: bool) -> BindResult<Resolved> {
        let mut resolved = Resolved {
            slots: Vec::with_capacity(args.len()),
            subscribe: Vec::new(),
            memoize: Vec::with_capacity(args.len()),
        };

        for arg in args {
            let definition = self.definition(arg.name(), arg.overrides())?;
            let memo_key = definition
                .variables
                .is_empty()
                .then(|| arg.name().to_owned());
            if let Some(key) = &memo_key {
                if let Some(value) = self.memo.lock().get(key) {
                    resolved.slots.push(Slot::Ready(value.clone()));
                    resolved.memoize.push(None);
                    continue;
                }
            }

            let handle = self.registry.handle_for(&definition);
            match handle.status() {
                QueryStatus::Failed(err) => return Err(err.into()),
                QueryStatus::Resolved(data) => {
                    if record {
                        self.record_used(arg.name(), &definition.variables, &handle);
                        resolved.subscribe.push(Arc::clone(&handle));
                    }
                    resolved.slots.push(Slot::Ready(data));
                }
                QueryStatus::Loading => {
                    resolved.slots.push(Slot::Waiting(handle.completion()));
                }
            }
            resolved.memoize.push(memo_key);
        }
        Ok(resolved)
    }

    fn record_used(&self, key: &str, variables: &Variables, handle: &Arc<QueryHandle>) {
        let mut used = self.used.lock();
        if used
            .iter()
            .any(|q| q.key == key && Arc::ptr_eq(&q.handle, handle))
        {
            return;
        }
        used.push(UsedQuery {
            key: key.to_owned(),
            variables: variables.clone(),
            handle: Arc::clone(handle),
        });
    }
}

fn unidentified(entity: &Value) -> BindError {
    BindError::UnidentifiedEntity {
        entity: entity.to_string(),
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("definitions", &self.definitions.read().len())
            .field("used", &self.used_count())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}
