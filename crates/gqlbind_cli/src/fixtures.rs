//! Demo data set served by the mock transport.

use gqlbind_cache::{gql, Document, MockTransport, MockTransportConfig, QueryError, Variables};
use gqlbind_runtime::{Definitions, QueryDefinition};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

// Operation names select the mock resolvers below.
pub const TODO_LIST_QUERY: &str = "query GetTodoList { todos { id title updatedOn } }";
pub const TODO_BY_ID_QUERY: &str =
    "query TodoByIdQuery($id: ID!) { todo(id: $id) { id title description completed updatedOn } }";
pub const USER_LIST_QUERY: &str = "query UserListQuery { users { id email } }";
pub const UPDATE_TODO_MUTATION: &str = "mutation UpdateTodoMutation($id: ID!, $input: UpdateTodoInput!) { updateTodo(id: $id, input: $input) { id title updatedOn } }";

#[derive(Debug, Clone)]
struct TodoRecord {
    id: String,
    title: String,
    description: String,
    completed: bool,
    updated_on: String,
    created_by: String,
}

#[derive(Debug, Clone)]
struct UserRecord {
    id: String,
    email: String,
    name: String,
    report_to: Option<String>,
}

/// Server-side state behind the demo resolvers.
#[derive(Debug, Default)]
pub struct Fixtures {
    todos: Vec<TodoRecord>,
    users: Vec<UserRecord>,
    revision: u32,
}

impl Fixtures {
    pub const USER_COUNT: usize = 10;

    /// Seeds `todos` todos and a fixed set of users.
    pub fn seed(todos: usize) -> Self {
        let users = (1..=Self::USER_COUNT)
            .map(|i| UserRecord {
                id: i.to_string(),
                email: format!("user{i}@example.com"),
                name: format!("User {i}"),
                report_to: (i > 1).then(|| (i - 1).to_string()),
            })
            .collect();
        let todos = (1..=todos)
            .map(|i| TodoRecord {
                id: i.to_string(),
                title: format!("Todo #{i}"),
                description: format!("Things to do for todo #{i}"),
                completed: i % 3 == 0,
                updated_on: timestamp(0, i),
                created_by: ((i - 1) % Self::USER_COUNT + 1).to_string(),
            })
            .collect();
        Self {
            todos,
            users,
            revision: 0,
        }
    }

    pub fn todo_count(&self) -> usize {
        self.todos.len()
    }

    pub fn title_of(&self, id: &str) -> Option<&str> {
        self.todos
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.title.as_str())
    }

    fn todo_list(&self) -> Value {
        let todos: Vec<Value> = self
            .todos
            .iter()
            .map(|t| {
                json!({
                    "__typename": "Todo",
                    "id": t.id,
                    "title": t.title,
                    "updatedOn": t.updated_on,
                })
            })
            .collect();
        json!({ "todos": todos })
    }

    fn todo_by_id(&self, id: &str) -> Value {
        let todo = self.todos.iter().find(|t| t.id == id).map(|t| {
            json!({
                "__typename": "Todo",
                "id": t.id,
                "title": t.title,
                "description": t.description,
                "completed": t.completed,
                "updatedOn": t.updated_on,
            })
        });
        json!({ "todo": todo })
    }

    fn user_list(&self) -> Value {
        let users: Vec<Value> = self
            .users
            .iter()
            .map(|u| json!({ "__typename": "User", "id": u.id, "email": u.email }))
            .collect();
        json!({ "users": users })
    }

    fn update_title(&mut self, id: &str, title: &str) -> Result<Value, QueryError> {
        self.revision += 1;
        let revision = self.revision;
        let todo = self
            .todos
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| QueryError::execution(format!("todo {id} not found")))?;
        title.clone_into(&mut todo.title);
        todo.updated_on = timestamp(revision, id.len());
        Ok(json!({
            "updateTodo": {
                "__typename": "Todo",
                "id": todo.id,
                "title": todo.title,
                "updatedOn": todo.updated_on,
            }
        }))
    }

    /// Author and manager of a todo, for log output.
    pub fn owner_of(&self, id: &str) -> Option<(String, Option<String>)> {
        let todo = self.todos.iter().find(|t| t.id == id)?;
        let user = self.users.iter().find(|u| u.id == todo.created_by)?;
        Some((user.name.clone(), user.report_to.clone()))
    }
}

fn timestamp(revision: u32, seed: usize) -> String {
    format!(
        "2024-05-{:02}T09:{:02}:00.000Z",
        seed % 28 + 1,
        revision % 60
    )
}

fn string_var<'a>(variables: &'a Variables, name: &str) -> Result<&'a str, QueryError> {
    variables
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| QueryError::execution(format!("missing variable `{name}`")))
}

/// Builds a mock transport whose resolvers read and write `fixtures`.
pub fn transport(fixtures: &Arc<Mutex<Fixtures>>, config: MockTransportConfig) -> MockTransport {
    let list = Arc::clone(fixtures);
    let by_id = Arc::clone(fixtures);
    let users = Arc::clone(fixtures);
    let update = Arc::clone(fixtures);
    MockTransport::new(config)
        .resolver("GetTodoList", move |_| Ok(list.lock().todo_list()))
        .resolver("TodoByIdQuery", move |vars| {
            Ok(by_id.lock().todo_by_id(string_var(vars, "id")?))
        })
        .resolver("UserListQuery", move |_| Ok(users.lock().user_list()))
        .resolver("UpdateTodoMutation", move |vars| {
            let id = string_var(vars, "id")?;
            let title = vars
                .get("input")
                .and_then(|input| input.get("title"))
                .and_then(Value::as_str)
                .ok_or_else(|| QueryError::execution("missing `input.title`"))?;
            update.lock().update_title(id, title)
        })
}

/// Named definitions shared by the demo components.
pub fn definitions(first_todo: &str) -> Definitions {
    Definitions::new()
        .with("todoList", QueryDefinition::new(gql(TODO_LIST_QUERY)))
        .with("userList", QueryDefinition::new(gql(USER_LIST_QUERY)))
        .with(
            "todoDetails",
            QueryDefinition::new(gql(TODO_BY_ID_QUERY)).variable("id", first_todo),
        )
}

/// The mutation behind the demo's server-side rename.
pub fn update_todo_mutation() -> Document {
    gql(UPDATE_TODO_MUTATION)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoSummary {
    pub id: String,
    pub title: String,
    pub updated_on: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TodoList {
    pub todos: Vec<TodoSummary>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoDetails {
    pub id: String,
    pub title: String,
    pub description: String,
    pub completed: bool,
    pub updated_on: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TodoById {
    pub todo: Option<TodoDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserList {
    pub users: Vec<UserSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gqlbind_cache::{Request, Transport};
    use serde_json::Map;

    fn vars(pairs: Value) -> Variables {
        match pairs {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_seed() {
        let fixtures = Fixtures::seed(4);
        assert_eq!(fixtures.todo_count(), 4);
        assert_eq!(fixtures.title_of("3"), Some("Todo #3"));
        assert_eq!(fixtures.users.len(), Fixtures::USER_COUNT);
        assert_eq!(
            fixtures.owner_of("2"),
            Some(("User 2".to_owned(), Some("1".to_owned())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_mutation() {
        let fixtures = Arc::new(Mutex::new(Fixtures::seed(2)));
        let transport = transport(&fixtures, MockTransportConfig::default());
        let data = transport
            .execute(Request::new(
                update_todo_mutation(),
                vars(json!({"id": "2", "input": {"title": "renamed"}})),
            ))
            .await
            .unwrap();

        assert_eq!(data["updateTodo"]["title"], "renamed");
        assert_eq!(fixtures.lock().title_of("2"), Some("renamed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_todo() {
        let fixtures = Arc::new(Mutex::new(Fixtures::seed(1)));
        let transport = transport(&fixtures, MockTransportConfig::default());
        let missing = transport
            .execute(Request::new(gql(TODO_BY_ID_QUERY), vars(json!({"id": "9"}))))
            .await
            .unwrap();
        assert_eq!(missing, json!({"todo": null}));

        let err = transport
            .execute(Request::new(
                update_todo_mutation(),
                vars(json!({"id": "9", "input": {"title": "x"}})),
            ))
            .await
            .unwrap_err();
        assert!(err.message.contains("not found"));
    }
}
