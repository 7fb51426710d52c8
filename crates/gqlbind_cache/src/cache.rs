//! In-memory normalized cache.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::trace;

use crate::adapter::FieldModifiers;
use crate::canonical::canonical_json;
use crate::document::{Document, DocumentId, Variables};
use crate::normalize::{denormalize, normalize, EntityId, EntityStore, Incomplete};

use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RootKey {
    document: DocumentId,
    variables: String,
}

impl RootKey {
    fn new(document: &Document, variables: &Variables) -> Self {
        Self {
            document: document.id(),
            variables: canonical_json(&Value::Object(variables.clone())),
        }
    }
}

#[derive(Debug, Default)]
struct Store {
    entities: EntityStore,
    roots: FxHashMap<RootKey, Value>,
}

impl Store {
    fn merge(&mut self, entities: Vec<(EntityId, Map<String, Value>)>) {
        for (id, fields) in entities {
            self.entities.entry(id).or_default().extend(fields);
        }
    }
}

/// Normalized store of query answers and entity records.
///
/// Query answers are kept per (document, canonical variables). Entities are
/// shared between all answers referencing them, so a change to one entity is
/// visible through every query selecting it.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    store: Mutex<Store>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a complete answer. Returns `None` when no answer is stored or
    /// when an entity it references is gone or lacks a selected field.
    pub fn read_query(&self, document: &Document, variables: &Variables) -> Option<Value> {
        let store = self.store.lock();
        let root = store.roots.get(&RootKey::new(document, variables))?;
        match denormalize(root, &store.entities) {
            Ok(data) => Some(data),
            Err(Incomplete::Dangling(id)) => {
                trace!(%document, entity = %id, "read incomplete: dangling reference");
                None
            }
            Err(Incomplete::MissingField(id, field)) => {
                trace!(%document, entity = %id, field, "read incomplete: missing field");
                None
            }
        }
    }

    /// Stores an answer, merging the entities it carries.
    pub fn write_query(&self, document: &Document, variables: &Variables, data: &Value) {
        let mut entities = Vec::new();
        let root = normalize(data, &mut entities);
        let mut store = self.store.lock();
        store.merge(entities);
        store.roots.insert(RootKey::new(document, variables), root);
    }

    /// Merges the entities found in `data` without storing an answer.
    pub fn write_entities(&self, data: &Value) {
        let mut entities = Vec::new();
        normalize(data, &mut entities);
        self.store.lock().merge(entities);
    }

    /// Forgets a stored answer.
    pub fn remove_query(&self, document: &Document, variables: &Variables) -> bool {
        self.store
            .lock()
            .roots
            .remove(&RootKey::new(document, variables))
            .is_some()
    }

    /// Applies field modifiers to an entity.
    ///
    /// Modifiers run without the store locked. Returns true when at least
    /// one field changed.
    pub fn modify(&self, id: &EntityId, modifiers: FieldModifiers) -> bool {
        let Some(current) = self.entity(id) else {
            return false;
        };

        let mut updates = Map::new();
        for (field, modifier) in modifiers {
            if let Some(previous) = current.get(&field) {
                let next = modifier(previous);
                if next != *previous {
                    updates.insert(field, next);
                }
            }
        }
        if updates.is_empty() {
            return false;
        }

        let mut store = self.store.lock();
        match store.entities.get_mut(id) {
            Some(record) => {
                record.extend(updates);
                true
            }
            None => false,
        }
    }

    /// Removes an entity record.
    pub fn evict(&self, id: &EntityId) -> bool {
        self.store.lock().entities.remove(id).is_some()
    }

    /// Returns a copy of an entity record, in normalized form.
    pub fn entity(&self, id: &EntityId) -> Option<Map<String, Value>> {
        self.store.lock().entities.get(id).cloned()
    }

    /// Number of entity records.
    pub fn entity_count(&self) -> usize {
        self.store.lock().entities.len()
    }

    /// Number of stored answers.
    pub fn query_count(&self) -> usize {
        self.store.lock().roots.len()
    }

    /// Drops everything.
    pub fn clear(&self) {
        let mut store = self.store.lock();
        store.entities.clear();
        store.roots.clear();
    }
}
