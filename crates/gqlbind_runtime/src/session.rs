//! Binding sessions.
//!
//! A [`BindingSession`] ties an [`Orchestrator`] to the render lifecycle of
//! one host component. Named reads are only permitted between
//! [`begin_render`](BindingSession::begin_render) and the following
//! [`commit`](BindingSession::commit) or
//! [`abort_render`](BindingSession::abort_render); the imperative
//! operations are available at any time.

use gqlbind_cache::{BoxFuture, Variables};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::definition::{Definitions, QueryArg};
use crate::error::{BindError, BindResult};
use crate::handle::Listener;
use crate::orchestrator::{FieldChanges, Orchestrator, RefetchTarget, Rollback, Update};
use crate::registry::Registry;
use crate::resolution::{PendingSet, Resolution};

/// Render lifecycle flags of a session.
#[derive(Debug, Default)]
pub struct RenderPhase {
    rendering: AtomicBool,
    mounted: AtomicBool,
}

impl RenderPhase {
    pub fn is_rendering(&self) -> bool {
        self.rendering.load(Ordering::Acquire)
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Enters the render phase.
    pub fn begin(&self) {
        self.rendering.store(true, Ordering::Release);
    }

    /// Leaves the render phase after a committed render.
    pub fn commit(&self) {
        self.mounted.store(true, Ordering::Release);
        self.rendering.store(false, Ordering::Release);
    }

    /// Leaves the render phase without committing.
    pub fn abort(&self) {
        self.rendering.store(false, Ordering::Release);
    }

    fn unmount(&self) {
        self.rendering.store(false, Ordering::Release);
        self.mounted.store(false, Ordering::Release);
    }
}

/// Query access for one host component.
pub struct BindingSession {
    phase: Arc<RenderPhase>,
    orchestrator: Orchestrator,
}

impl BindingSession {
    /// Creates a session. `on_update` runs when a query this session read
    /// changes, once the session has committed a render.
    pub fn new(registry: Arc<Registry>, on_update: impl Fn() + Send + Sync + 'static) -> Self {
        let phase = Arc::new(RenderPhase::default());
        let mounted = Arc::clone(&phase);
        let listener: Listener = Arc::new(move || {
            if mounted.is_mounted() {
                on_update();
            }
        });
        Self {
            orchestrator: Orchestrator::new(registry, Arc::clone(&phase), listener),
            phase,
        }
    }

    pub fn phase(&self) -> &RenderPhase {
        &self.phase
    }

    pub fn is_rendering(&self) -> bool {
        self.phase.is_rendering()
    }

    pub fn is_mounted(&self) -> bool {
        self.phase.is_mounted()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Starts a render pass with the current definitions. Drops the
    /// subscriptions of the previous pass.
    pub fn begin_render(&self, definitions: Definitions) {
        self.phase.begin();
        self.orchestrator.set_definitions(definitions);
        self.orchestrator.cleanup();
    }

    /// Ends a render pass that the host committed.
    pub fn commit(&self) {
        self.phase.commit();
    }

    /// Ends a render pass that suspended or failed.
    pub fn abort_render(&self) {
        self.phase.abort();
    }

    /// Drops every subscription. Runs on drop as well.
    pub fn teardown(&self) {
        self.orchestrator.cleanup();
        self.phase.unmount();
        trace!("binding session torn down");
    }

    /// Reads one named query. Render phase only.
    pub fn query(&self, name: &str) -> BindResult<Resolution<Value>> {
        if !self.is_rendering() {
            return Err(BindError::CapabilityViolation { operation: "query" });
        }
        Ok(self
            .orchestrator
            .get(&[QueryArg::key(name)])?
            .map(|mut values| values.pop().unwrap_or(Value::Null)))
    }

    /// Reads one named query into `T`. Render phase only.
    pub fn query_as<T: DeserializeOwned>(&self, name: &str) -> BindResult<Resolution<T>> {
        self.query(name)?.decode()
    }

    /// See [`Orchestrator::get`].
    pub fn get(&self, args: &[QueryArg]) -> BindResult<Resolution<Vec<Value>>> {
        self.orchestrator.get(args)
    }

    /// See [`Orchestrator::peek`].
    pub fn peek(&self, args: &[QueryArg]) -> BoxFuture<'static, BindResult<Vec<Value>>> {
        self.orchestrator.peek(args)
    }

    /// See [`Orchestrator::read`].
    pub fn read(&self, args: &[QueryArg]) -> BindResult<Vec<Option<Value>>> {
        self.orchestrator.read(args)
    }

    /// See [`Orchestrator::write`].
    pub fn write(
        &self,
        key: &str,
        update: Update,
        overrides: Option<&Variables>,
    ) -> BindResult<Rollback> {
        self.orchestrator.write(key, update, overrides)
    }

    /// See [`Orchestrator::write_entity`].
    pub fn write_entity(&self, entity: &Value, changes: FieldChanges) -> BindResult<Rollback> {
        self.orchestrator.write_entity(entity, changes)
    }

    /// See [`Orchestrator::evict`].
    pub fn evict(&self, entity: &Value) -> BindResult<bool> {
        self.orchestrator.evict(entity)
    }

    /// See [`Orchestrator::refetch`].
    pub fn refetch(&self, target: &RefetchTarget, fresh: bool) -> PendingSet {
        self.orchestrator.refetch(target, fresh)
    }

    /// See [`Orchestrator::preload`].
    pub fn preload(&self, keys: &[&str]) -> BindResult<BoxFuture<'static, BindResult<()>>> {
        self.orchestrator.preload(keys)
    }

    /// Renders until no query is pending.
    ///
    /// Each attempt begins a render pass and runs `render`. A suspended pass
    /// is aborted, its queries awaited and the render retried. A ready pass
    /// is committed. Errors abort the pass and are returned.
    pub async fn render<T, F>(&self, definitions: &Definitions, mut render: F) -> BindResult<T>
    where
        F: FnMut(&Self) -> BindResult<Resolution<T>>,
    {
        loop {
            self.begin_render(definitions.clone());
            match render(self) {
                Ok(Resolution::Ready(value)) => {
                    self.commit();
                    return Ok(value);
                }
                Ok(Resolution::Pending(pending)) => {
                    self.abort_render();
                    trace!(pending = pending.len(), "render suspended");
                    pending.settled().await;
                }
                Err(err) => {
                    self.abort_render();
                    return Err(err);
                }
            }
        }
    }
}

impl Drop for BindingSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for BindingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingSession")
            .field("phase", &self.phase)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::definition::QueryDefinition;
    use gqlbind_cache::{gql, Client, MockTransport, MockTransportConfig};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct TodoList {
        todos: Vec<Todo>,
    }

    #[derive(Debug, Deserialize)]
    struct Todo {
        id: String,
        title: String,
    }

    fn setup() -> (Client, Arc<Registry>, Definitions) {
        let transport = MockTransport::new(MockTransportConfig::default().latency(Duration::from_millis(500)))
            .resolver("GetTodoList", |_| {
                Ok(json!({"todos": [
                    {"__typename": "Todo", "id": "1", "title": "first"},
                    {"__typename": "Todo", "id": "2", "title": "second"}
                ]}))
            });
        let client = Client::new(transport);
        let registry = Registry::for_adapter(&client, RuntimeConfig::default());
        let definitions = Definitions::new().with(
            "todoList",
            QueryDefinition::new(gql("query GetTodoList { todos { id title } }")),
        );
        (client, registry, definitions)
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_outside_render_phase() {
        let (_client, registry, definitions) = setup();
        let session = BindingSession::new(registry, || {});
        session.begin_render(definitions);
        session.commit();
        assert_eq!(
            session.query("todoList").unwrap_err(),
            BindError::CapabilityViolation { operation: "query" }
        );
        assert_eq!(
            session.get(&["todoList".into()]).unwrap_err(),
            BindError::CapabilityViolation { operation: "get" }
        );
        // imperative reads stay available
        assert_eq!(session.read(&["todoList".into()]).unwrap(), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_retries_until_ready() {
        let (_client, registry, definitions) = setup();
        let session = BindingSession::new(registry, || {});
        let mut attempts = 0;
        let list: TodoList = session
            .render(&definitions, |s| {
                attempts += 1;
                s.query_as::<TodoList>("todoList")
            })
            .await
            .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(list.todos.len(), 2);
        assert_eq!(list.todos[0].id, "1");
        assert_eq!(list.todos[1].title, "second");
        assert!(session.is_mounted());
        assert!(!session.is_rendering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_only_after_mount() {
        let (_client, registry, definitions) = setup();
        let updates = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&updates);
        let session = BindingSession::new(Arc::clone(&registry), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let _ = session
            .render(&definitions, |s| s.query("todoList"))
            .await
            .unwrap();

        session
            .write(
                "todoList",
                Update::replace(json!({"todos": [{"__typename": "Todo", "id": "1", "title": "only"}]})),
                None,
            )
            .unwrap();
        assert_eq!(updates.load(Ordering::SeqCst), 1);

        session.teardown();
        assert!(!session.is_mounted());
        assert_eq!(session.orchestrator().subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_subscriptions() {
        let (_client, registry, definitions) = setup();
        let session = BindingSession::new(Arc::clone(&registry), || {});
        session.render(&definitions, |s| s.query("todoList")).await.unwrap();
        let handle = registry.handle_for(definitions.get("todoList").unwrap());
        assert_eq!(handle.listener_count(), 1);

        drop(session);
        assert_eq!(handle.listener_count(), 0);
        assert!(handle.disposal_pending());
    }
}
