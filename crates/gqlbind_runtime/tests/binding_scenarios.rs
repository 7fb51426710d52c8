//! Integration tests for binding sessions against the in-memory client.

use gqlbind_cache::{
    gql, CacheAdapter, Client, Document, ErrorCode, FetchPolicy, MockTransport,
    MockTransportConfig, QueryError, Variables,
};
use gqlbind_runtime::{
    BindError, BindingSession, Definitions, FieldUpdate, QueryArg, QueryDefinition, QueryStatus,
    RefetchTarget, Registry, Resolution, RuntimeConfig, Update,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LATENCY: Duration = Duration::from_millis(500);

fn todo_list_doc() -> Document {
    gql("query GetTodoList { todos { id title } }")
}

fn todo_by_id_doc() -> Document {
    gql("query TodoById($id: ID!) { todo(id: $id) { id title } }")
}

fn todos(n: usize) -> Value {
    let todos: Vec<Value> = (1..=n)
        .map(|i| json!({"__typename": "Todo", "id": i.to_string(), "title": format!("todo {i}")}))
        .collect();
    json!({ "todos": todos })
}

struct World {
    transport: Arc<MockTransport>,
    client: Client,
    registry: Arc<Registry>,
    definitions: Definitions,
}

fn world(todo_count: usize, grace: Duration) -> World {
    let transport = Arc::new(
        MockTransport::new(MockTransportConfig::default().latency(LATENCY))
            .resolver("GetTodoList", move |_| Ok(todos(todo_count)))
            .resolver("TodoById", |vars| {
                let id = vars.get("id").and_then(Value::as_str).unwrap_or("0").to_owned();
                Ok(json!({"todo": {"__typename": "Todo", "id": id, "title": format!("todo {id}")}}))
            })
            .resolver("Offline", |_| Err(QueryError::network("connection refused"))),
    );
    let client = Client::new(Arc::clone(&transport));
    let registry = Registry::for_adapter(&client, RuntimeConfig::default().grace_period(grace));
    let definitions = Definitions::new()
        .with("todoList", QueryDefinition::new(todo_list_doc()))
        .with(
            "todoDetails",
            QueryDefinition::new(todo_by_id_doc()).variable("id", "1"),
        )
        .with("offline", QueryDefinition::new(gql("query Offline { status }")));
    World {
        transport,
        client,
        registry,
        definitions,
    }
}

fn counting_session(registry: &Arc<Registry>) -> (BindingSession, Arc<AtomicUsize>) {
    let updates = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&updates);
    let session = BindingSession::new(Arc::clone(registry), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (session, updates)
}

fn todo_count(data: &Value) -> usize {
    data["todos"].as_array().map_or(0, Vec::len)
}

/// Variable bags differing only in key order share one handle.
#[tokio::test(start_paused = true)]
async fn test_variable_order_shares_handle() {
    let w = world(3, Duration::from_secs(5));
    let doc = gql("query Page($first: Int, $after: String) { todos { id } }");
    let a = QueryDefinition::new(doc.clone())
        .variable("first", 10)
        .variable("after", "x");
    let b = QueryDefinition::new(doc)
        .variable("after", "x")
        .variable("first", 10);

    let ha = w.registry.handle_for(&a);
    let hb = w.registry.handle_for(&b);
    assert!(Arc::ptr_eq(&ha, &hb));
    assert_eq!(w.registry.len(), 1);
}

/// A loading query suspends the render; once settled, it reads synchronously.
#[tokio::test(start_paused = true)]
async fn test_suspend_then_resolve() {
    let w = world(3, Duration::from_secs(5));
    let (session, _) = counting_session(&w.registry);

    session.begin_render(w.definitions.clone());
    let pending = match session.query("todoList").unwrap() {
        Resolution::Pending(pending) => pending,
        Resolution::Ready(_) => panic!("cold cache must suspend"),
    };
    session.abort_render();
    assert!(!session.is_mounted());

    let started = tokio::time::Instant::now();
    pending.settled().await;
    assert!(started.elapsed() >= LATENCY);

    session.begin_render(w.definitions.clone());
    let data = session.query("todoList").unwrap().ready().unwrap();
    session.commit();
    assert_eq!(todo_count(&data), 3);
    assert_eq!(w.transport.calls_for("GetTodoList"), 1);
}

/// Dropping the first of ten todos leaves nine and notifies once.
#[tokio::test(start_paused = true)]
async fn test_write_remove_first_notifies_once() {
    let w = world(10, Duration::from_secs(5));
    let (session, updates) = counting_session(&w.registry);
    session
        .render(&w.definitions, |s| s.query("todoList"))
        .await
        .unwrap();

    let handle = w.registry.handle_for(w.definitions.get("todoList").unwrap());
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    let _guard = handle.subscribe(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    session
        .write(
            "todoList",
            Update::with(|prev| {
                let mut next = prev?.clone();
                next["todos"].as_array_mut()?.remove(0);
                Some(next)
            }),
            None,
        )
        .unwrap();

    let data = w
        .client
        .read_query(&todo_list_doc(), &Variables::new())
        .unwrap();
    assert_eq!(todo_count(&data), 9);
    assert_eq!(data["todos"][0]["id"], "2");
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(updates.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status().data().map(todo_count), Some(9));
}

/// Rolling back a write restores the cached answer exactly.
#[tokio::test(start_paused = true)]
async fn test_rollback_restores_previous_state() {
    let w = world(4, Duration::from_secs(5));
    let (session, _) = counting_session(&w.registry);
    session
        .render(&w.definitions, |s| s.query("todoList"))
        .await
        .unwrap();
    let before = w.client.read_query(&todo_list_doc(), &Variables::new());

    let rollback = session
        .write("todoList", Update::replace(todos(1)), None)
        .unwrap();
    assert_ne!(
        w.client.read_query(&todo_list_doc(), &Variables::new()),
        before
    );

    rollback.run();
    assert_eq!(
        w.client.read_query(&todo_list_doc(), &Variables::new()),
        before
    );
}

/// A fresh refetch drops to Loading and notifies before the request goes out.
#[tokio::test(start_paused = true)]
async fn test_fresh_refetch_notifies_before_request() {
    let w = world(2, Duration::from_secs(5));
    let (session, _) = counting_session(&w.registry);
    session
        .render(&w.definitions, |s| s.query("todoList"))
        .await
        .unwrap();

    let handle = w.registry.handle_for(w.definitions.get("todoList").unwrap());
    let settled = handle.completion();
    assert!(settled.is_settled());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let transport = Arc::clone(&w.transport);
    let observed = Arc::downgrade(&handle);
    let _guard = handle.subscribe(Arc::new(move || {
        let loading = observed
            .upgrade()
            .is_some_and(|h| h.status().is_loading());
        sink.lock().push((loading, transport.calls_for("GetTodoList")));
    }));

    let refetching = session.refetch(&RefetchTarget::from("todoList"), true);
    assert!(handle.status().is_loading());
    assert!(!handle.completion().is_settled());
    assert_eq!(*events.lock(), vec![(true, 1)]);

    refetching.settled().await;
    assert_eq!(w.transport.calls_for("GetTodoList"), 2);
    assert_eq!(*events.lock(), vec![(true, 1), (false, 2)]);
    assert!(matches!(handle.status(), QueryStatus::Resolved(_)));
}

/// After an eviction, reads depending on the entity return nothing.
#[tokio::test(start_paused = true)]
async fn test_evict_then_read_returns_none() {
    let w = world(2, Duration::from_secs(5));
    let (session, _) = counting_session(&w.registry);
    let detail = session
        .render(&w.definitions, |s| s.query("todoDetails"))
        .await
        .unwrap();
    assert_eq!(detail["todo"]["id"], "1");

    assert!(session
        .evict(&json!({"__typename": "Todo", "id": "1"}))
        .unwrap());
    assert_eq!(session.read(&["todoDetails".into()]).unwrap(), vec![None]);
}

/// Handles without listeners are disposed after the grace period unless a
/// listener comes back first.
#[tokio::test(start_paused = true)]
async fn test_grace_period_disposal() {
    let grace = Duration::from_secs(5);
    let w = world(2, grace);
    let driver = tokio::spawn(Arc::clone(&w.registry).drive_disposals());
    let handle = w.registry.handle_for(w.definitions.get("todoList").unwrap());

    {
        let (session, _) = counting_session(&w.registry);
        session
            .render(&w.definitions, |s| s.query("todoList"))
            .await
            .unwrap();
        assert_eq!(handle.listener_count(), 1);
    }
    assert!(handle.disposal_pending());

    // re-subscribing within the grace period keeps the state
    tokio::time::sleep(grace / 2).await;
    let (session, _) = counting_session(&w.registry);
    session.begin_render(w.definitions.clone());
    assert!(session.query("todoList").unwrap().is_ready());
    session.commit();
    assert!(!handle.disposal_pending());
    tokio::time::sleep(grace * 2).await;
    assert!(handle.is_live());

    drop(session);
    tokio::time::sleep(grace + Duration::from_millis(1)).await;
    assert!(!handle.is_live());
    assert_eq!(w.registry.len(), 1);
    assert_eq!(w.client.active_watches(), 0);
    driver.abort();
}

/// Render-phase reads are refused outside the render phase.
#[tokio::test(start_paused = true)]
async fn test_capability_violation() {
    let w = world(2, Duration::from_secs(5));
    let (session, _) = counting_session(&w.registry);
    assert_eq!(
        session.get(&["todoList".into()]).unwrap_err(),
        BindError::CapabilityViolation { operation: "get" }
    );
    assert_eq!(w.transport.call_count(), 0);
}

/// Transport failures surface at the first read.
#[tokio::test(start_paused = true)]
async fn test_failure_surfaces_on_read() {
    let w = world(2, Duration::from_secs(5));
    let (session, _) = counting_session(&w.registry);
    let err = session
        .render(&w.definitions, |s| s.query("offline"))
        .await
        .unwrap_err();
    assert_eq!(
        err.query_error().map(|e| e.code),
        Some(ErrorCode::NetworkError)
    );
    assert!(!session.is_rendering());
}

/// Preload warms the cache; a later render reads without suspending.
#[tokio::test(start_paused = true)]
async fn test_preload_then_render() {
    let w = world(5, Duration::from_secs(5));
    let (session, _) = counting_session(&w.registry);
    session.begin_render(w.definitions.clone());
    session.commit();
    session.preload(&["todoList", "todoDetails"]).unwrap().await.unwrap();

    session.begin_render(w.definitions.clone());
    let values = session
        .get(&["todoList".into(), "todoDetails".into()])
        .unwrap()
        .ready()
        .unwrap();
    session.commit();
    assert_eq!(todo_count(&values[0]), 5);
    assert_eq!(values[1]["todo"]["title"], "todo 1");
    assert_eq!(w.transport.call_count(), 2);
}

/// Peek waits for data without subscribing.
#[tokio::test(start_paused = true)]
async fn test_peek() {
    let w = world(2, Duration::from_secs(5));
    let (session, _) = counting_session(&w.registry);
    session.begin_render(w.definitions.clone());
    session.commit();

    let mut vars = Variables::new();
    vars.insert("id".into(), json!("2"));
    let values = session
        .peek(&[QueryArg::with_variables("todoDetails", vars)])
        .await
        .unwrap();
    assert_eq!(values[0]["todo"]["id"], "2");
    assert_eq!(session.orchestrator().subscription_count(), 0);

    let err = session.peek(&["missing".into()]).await.unwrap_err();
    assert_eq!(err, BindError::unknown_definition("missing"));
}

/// Refetch filters only see queries this session used.
#[tokio::test(start_paused = true)]
async fn test_refetch_filter_over_used_queries() {
    let w = world(2, Duration::from_secs(5));
    let (session, _) = counting_session(&w.registry);
    let mut two = Variables::new();
    two.insert("id".into(), json!("2"));
    let args = [
        QueryArg::key("todoList"),
        QueryArg::key("todoDetails"),
        QueryArg::with_variables("todoDetails", two),
    ];
    session
        .render(&w.definitions, |s| s.get(&args))
        .await
        .unwrap();
    assert_eq!(w.transport.calls_for("TodoById"), 2);

    session
        .refetch(
            &RefetchTarget::filter(|key, vars| key == "todoDetails" && vars["id"] == "2"),
            false,
        )
        .settled()
        .await;
    assert_eq!(w.transport.calls_for("TodoById"), 3);
    assert_eq!(w.transport.calls_for("GetTodoList"), 1);

    session
        .refetch(&RefetchTarget::Keys(vec!["todoList".into(), "offline".into()]), false)
        .settled()
        .await;
    assert_eq!(w.transport.calls_for("GetTodoList"), 2);
    assert_eq!(w.transport.calls_for("Offline"), 0);
}

/// Two sessions on one registry share handles and see each other's writes.
#[tokio::test(start_paused = true)]
async fn test_sessions_share_handles() {
    let w = world(3, Duration::from_secs(5));
    let (first, first_updates) = counting_session(&w.registry);
    let (second, second_updates) = counting_session(&w.registry);
    first
        .render(&w.definitions, |s| s.query("todoList"))
        .await
        .unwrap();
    second
        .render(&w.definitions, |s| s.query("todoList"))
        .await
        .unwrap();
    assert_eq!(w.transport.calls_for("GetTodoList"), 1);

    first
        .write_entity(
            &json!({"__typename": "Todo", "id": "2"}),
            vec![("title".into(), FieldUpdate::set("renamed"))],
        )
        .unwrap();
    assert_eq!(first_updates.load(Ordering::SeqCst), 1);
    assert_eq!(second_updates.load(Ordering::SeqCst), 1);

    second.begin_render(w.definitions.clone());
    let data = second.query("todoList").unwrap().ready().unwrap();
    second.commit();
    assert_eq!(data["todos"][1]["title"], "renamed");
}

/// A network-only query follows later cache writes without refetching.
#[tokio::test(start_paused = true)]
async fn test_network_only_sees_local_writes() {
    let w = world(10, Duration::from_secs(5));
    let definitions = Definitions::new().with(
        "todoList",
        QueryDefinition::new(todo_list_doc()).fetch_policy(FetchPolicy::NetworkOnly),
    );
    let (session, updates) = counting_session(&w.registry);
    let data = session
        .render(&definitions, |s| s.query("todoList"))
        .await
        .unwrap();
    assert_eq!(todo_count(&data), 10);

    let handle = w.registry.handle_for(definitions.get("todoList").unwrap());
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    let _guard = handle.subscribe(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    session
        .write(
            "todoList",
            Update::with(|prev| {
                let mut next = prev?.clone();
                next["todos"].as_array_mut()?.remove(0);
                Some(next)
            }),
            None,
        )
        .unwrap();

    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(updates.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status().data().map(todo_count), Some(9));
    assert_eq!(w.transport.calls_for("GetTodoList"), 1);
}

/// Every registry lookup through one client, or a clone of it, yields the
/// same registry and therefore the same handles.
#[tokio::test(start_paused = true)]
async fn test_registry_lookups_share_handles() {
    let w = world(3, Duration::from_secs(5));
    let again = Registry::for_adapter(&w.client, RuntimeConfig::default());
    let through_clone = Registry::for_adapter(&w.client.clone(), RuntimeConfig::default());
    assert!(Arc::ptr_eq(&w.registry, &again));
    assert!(Arc::ptr_eq(&w.registry, &through_clone));

    let (first, _) = counting_session(&again);
    let (second, _) = counting_session(&through_clone);
    first
        .render(&w.definitions, |s| s.query("todoList"))
        .await
        .unwrap();
    second
        .render(&w.definitions, |s| s.query("todoList"))
        .await
        .unwrap();

    let definition = w.definitions.get("todoList").unwrap();
    assert!(Arc::ptr_eq(
        &again.handle_for(definition),
        &through_clone.handle_for(definition)
    ));
    assert_eq!(w.registry.len(), 1);
    assert_eq!(w.transport.calls_for("GetTodoList"), 1);
}

/// A fresh refetch issued while the first request is in flight wins: the
/// first response is dropped and listeners hear of the query twice.
#[tokio::test(start_paused = true)]
async fn test_fresh_refetch_during_initial_load() {
    let w = world(3, Duration::from_secs(5));
    let handle = w.registry.handle_for(w.definitions.get("todoList").unwrap());
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    let _guard = handle.subscribe(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert!(handle.status().is_loading());

    tokio::time::sleep(LATENCY / 5).await;
    let data = handle.refetch(true).wait().await.unwrap();
    assert_eq!(todo_count(&data), 3);

    tokio::time::sleep(LATENCY * 2).await;
    assert_eq!(notified.load(Ordering::SeqCst), 2);
    assert_eq!(w.transport.calls_for("GetTodoList"), 2);
    assert!(matches!(handle.status(), QueryStatus::Resolved(_)));
}

/// Once the client is gone, cache operations report it.
#[tokio::test(start_paused = true)]
async fn test_dropped_client_is_reported() {
    let World {
        client,
        registry,
        definitions,
        ..
    } = world(2, Duration::from_secs(5));
    let (session, _) = counting_session(&registry);
    session.begin_render(definitions);
    session.commit();
    drop(client);

    assert_eq!(
        session.read(&["todoList".into()]).unwrap_err(),
        BindError::AdapterDropped
    );
}
