//! Scripted walkthrough of the binding runtime against the demo data set.
//!
//! Three components (a todo list, a user list and a todo detail view) are
//! mounted as binding sessions over one registry, then the list is edited
//! through local writes, an optimistic change, a mutation, a hard refetch
//! and an eviction.

use colored::Colorize;
use gqlbind_cache::{Client, MockTransportConfig, Variables};
use gqlbind_runtime::{
    BindResult, BindingSession, FieldUpdate, QueryArg, RefetchTarget, Registry,
    RuntimeConfig, Update,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::fixtures::{self, Fixtures, TodoById, TodoList, UserList};

/// Delay before an optimistic change is rolled back.
const RESTORE_DELAY: Duration = Duration::from_secs(5);

/// Demo settings.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub latency: Duration,
    pub grace_period: Duration,
    pub todos: usize,
    pub quiet: bool,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(500),
            grace_period: Duration::from_secs(5),
            todos: 10,
            quiet: false,
        }
    }
}

/// What the walkthrough observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemoReport {
    pub initial_todos: usize,
    pub list_render_passes: usize,
    pub users: usize,
    pub user_render_passes: usize,
    pub todos_after_remove: usize,
    pub optimistic_title: String,
    pub restored_title: String,
    pub mutated_title: String,
    pub todos_after_refetch: usize,
    pub details_after_evict: bool,
    pub list_updates: usize,
    pub watches_after_teardown: usize,
}

struct Printer {
    quiet: bool,
    step: usize,
}

impl Printer {
    fn step(&mut self, title: &str, detail: impl AsRef<str>) {
        self.step += 1;
        info!(step = self.step, "{title}");
        if !self.quiet {
            println!(
                "{} {} {}",
                format!("[{}]", self.step).blue(),
                title.bold(),
                detail.as_ref().dimmed()
            );
        }
    }
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let bump = Arc::clone(&count);
    (count, move || {
        bump.fetch_add(1, Ordering::SeqCst);
    })
}

fn todo_entity(id: &str) -> Value {
    json!({ "__typename": "Todo", "id": id })
}

fn id_variables(id: &str) -> Variables {
    let mut variables = Variables::new();
    variables.insert("id".to_owned(), json!(id));
    variables
}

fn read_list(session: &BindingSession) -> BindResult<TodoList> {
    let value = session
        .read(&["todoList".into()])?
        .pop()
        .flatten()
        .unwrap_or_else(|| json!({ "todos": [] }));
    Ok(serde_json::from_value(value)?)
}

fn title_in(list: &TodoList, id: &str) -> String {
    list.todos
        .iter()
        .find(|t| t.id == id)
        .map(|t| t.title.clone())
        .unwrap_or_default()
}

/// Runs the walkthrough.
pub async fn run(options: &DemoOptions) -> BindResult<DemoReport> {
    let mut out = Printer {
        quiet: options.quiet,
        step: 0,
    };
    let mut report = DemoReport::default();

    let fixtures = Arc::new(Mutex::new(Fixtures::seed(options.todos)));
    let transport = fixtures::transport(
        &fixtures,
        MockTransportConfig::default().latency(options.latency),
    );
    let client = Client::new(transport);
    let registry = Registry::for_adapter(
        &client,
        RuntimeConfig::new().grace_period(options.grace_period),
    );
    let disposals = tokio::spawn(Arc::clone(&registry).drive_disposals());

    let first = "1".to_owned();
    let definitions = fixtures::definitions(&first);

    let (list_updates, on_list_update) = counter();
    let todo_list = BindingSession::new(Arc::clone(&registry), on_list_update);
    let mut passes = 0;
    let list: TodoList = todo_list
        .render(&definitions, |s| {
            passes += 1;
            s.query_as("todoList")
        })
        .await?;
    report.initial_todos = list.todos.len();
    report.list_render_passes = passes;
    out.step(
        "mount TodoList",
        format!(
            "suspended, then rendered {} todos in {passes} passes",
            list.todos.len()
        ),
    );

    todo_list.preload(&["userList"])?.await?;
    let user_list = BindingSession::new(Arc::clone(&registry), || {});
    let mut passes = 0;
    let users: UserList = user_list
        .render(&definitions, |s| {
            passes += 1;
            s.query_as("userList")
        })
        .await?;
    report.users = users.users.len();
    report.user_render_passes = passes;
    out.step(
        "preload UserList",
        format!("{} users ready in {passes} pass", users.users.len()),
    );

    let selected = list
        .todos
        .get(1)
        .or_else(|| list.todos.first())
        .map(|t| t.id.clone())
        .unwrap_or(first);
    let details_arg = QueryArg::with_variables("todoDetails", id_variables(&selected));
    let details = BindingSession::new(Arc::clone(&registry), || {});
    let detail: TodoById = details
        .render(&definitions, |s| {
            s.get(std::slice::from_ref(&details_arg))?
                .map(|mut values| values.pop().unwrap_or(Value::Null))
                .decode()
        })
        .await?;
    let owner = fixtures.lock().owner_of(&selected);
    out.step(
        "mount TodoDetails",
        match (&detail.todo, owner) {
            (Some(todo), Some((name, _))) => format!(
                "{} ({}) by {name}, completed: {}",
                todo.title, todo.description, todo.completed
            ),
            (Some(todo), None) => todo.title.clone(),
            (None, _) => format!("todo {selected} not found"),
        },
    );

    let remove_first = Update::with(|current| {
        let mut data = current?.clone();
        let todos = data.get_mut("todos")?.as_array_mut()?;
        if todos.is_empty() {
            return None;
        }
        todos.remove(0);
        Some(data)
    });
    let before = list_updates.load(Ordering::SeqCst);
    todo_list.write("todoList", remove_first, None)?;
    report.todos_after_remove = read_list(&todo_list)?.todos.len();
    out.step(
        "remove first todo",
        format!(
            "{} todos left, list notified {} time(s)",
            report.todos_after_remove,
            list_updates.load(Ordering::SeqCst) - before
        ),
    );

    let rollback = todo_list.write_entity(
        &todo_entity(&selected),
        vec![(
            "title".to_owned(),
            FieldUpdate::with(|title| {
                json!(format!("{} (optimistic)", title.as_str().unwrap_or_default()))
            }),
        )],
    )?;
    report.optimistic_title = title_in(&read_list(&todo_list)?, &selected);
    out.step(
        "optimistic title change",
        format!("list shows `{}`", report.optimistic_title),
    );
    tokio::time::sleep(RESTORE_DELAY).await;
    rollback.run();
    report.restored_title = title_in(&read_list(&todo_list)?, &selected);
    out.step(
        "restore title",
        format!("list shows `{}` again", report.restored_title),
    );

    let new_title = format!("Todo #{selected} (updated)");
    let mut variables = id_variables(&selected);
    variables.insert("input".to_owned(), json!({ "title": new_title }));
    client
        .mutate(&fixtures::update_todo_mutation(), variables)
        .await?;
    report.mutated_title = title_in(&read_list(&todo_list)?, &selected);
    out.step(
        "update title on server",
        format!("list shows `{}`", report.mutated_title),
    );

    let pending = todo_list.refetch(&RefetchTarget::Key("todoList".to_owned()), true);
    let loading = definitions
        .get("todoList")
        .map(|d| registry.handle_for(d).status().is_loading())
        .unwrap_or_default();
    pending.wait_all().await?;
    report.todos_after_refetch = read_list(&todo_list)?.todos.len();
    out.step(
        "hard refetch TodoList",
        format!(
            "loading: {loading}, {} todos from server",
            report.todos_after_refetch
        ),
    );

    let evicted = todo_list.evict(&todo_entity(&selected))?;
    report.details_after_evict = details
        .read(std::slice::from_ref(&details_arg))?
        .pop()
        .flatten()
        .is_some();
    out.step(
        "evict todo",
        format!(
            "evicted: {evicted}, details cached: {}",
            report.details_after_evict
        ),
    );

    report.list_updates = list_updates.load(Ordering::SeqCst);
    drop(details);
    drop(user_list);
    drop(todo_list);
    tokio::time::sleep(options.grace_period + Duration::from_millis(1)).await;
    report.watches_after_teardown = client.active_watches();
    out.step(
        "unmount",
        format!(
            "{} active watches after the grace period",
            report.watches_after_teardown
        ),
    );

    disposals.abort();
    debug!(?report, "demo finished");
    if !options.quiet {
        println!("{}", "demo finished".green());
    }
    Ok(report)
}
