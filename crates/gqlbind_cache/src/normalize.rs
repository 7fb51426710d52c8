//! Normalization of data trees into entity records.
//!
//! Every object carrying `__typename` and `id` (or `_id`) is an entity. On
//! write it is replaced by a reference that remembers which fields this
//! position selected; on read the reference is projected back out of the
//! entity record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use rustc_hash::FxHashMap;

pub(crate) const REF_KEY: &str = "__ref";
pub(crate) const FIELDS_KEY: &str = "__fields";
const TYPENAME_KEY: &str = "__typename";

/// Identity of a normalized entity: `<__typename>:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies an entity by its `__typename` and `id` (falling back to `_id`).
pub fn identify(entity: &Value) -> Option<EntityId> {
    let object = entity.as_object()?;
    let typename = object.get(TYPENAME_KEY)?.as_str()?;
    let id = object.get("id").or_else(|| object.get("_id"))?;
    let id = match id {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(EntityId(format!("{}:{}", typename, id)))
}

pub(crate) type EntityStore = FxHashMap<EntityId, Map<String, Value>>;

/// Replaces entities in `value` by references, pushing their records to
/// `entities` in visiting order.
pub(crate) fn normalize(value: &Value, entities: &mut Vec<(EntityId, Map<String, Value>)>) -> Value {
    match value {
        Value::Object(object) => {
            let fields: Map<String, Value> = object
                .iter()
                .map(|(key, field)| (key.clone(), normalize(field, entities)))
                .collect();
            match identify(value) {
                Some(id) => {
                    let selected: Vec<Value> =
                        object.keys().map(|key| Value::String(key.clone())).collect();
                    let mut reference = Map::new();
                    reference.insert(REF_KEY.to_owned(), Value::String(id.0.clone()));
                    reference.insert(FIELDS_KEY.to_owned(), Value::Array(selected));
                    entities.push((id, fields));
                    Value::Object(reference)
                }
                None => Value::Object(fields),
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|item| normalize(item, entities)).collect()),
        other => other.clone(),
    }
}

/// Why a stored tree cannot be read back completely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Incomplete {
    /// A referenced entity is not in the store.
    Dangling(EntityId),
    /// A selected field is missing from an entity record.
    MissingField(EntityId, String),
}

/// Rebuilds a data tree from a normalized one.
///
/// Dangling references inside lists are dropped; anywhere else they make the
/// whole read incomplete.
pub(crate) fn denormalize(value: &Value, entities: &EntityStore) -> Result<Value, Incomplete> {
    match value {
        Value::Object(object) => match object.get(REF_KEY).and_then(Value::as_str) {
            Some(id) => resolve_reference(EntityId::new(id), object.get(FIELDS_KEY), entities),
            None => object
                .iter()
                .map(|(key, field)| Ok((key.clone(), denormalize(field, entities)?)))
                .collect::<Result<Map<_, _>, _>>()
                .map(Value::Object),
        },
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match denormalize(item, entities) {
                    Ok(v) => out.push(v),
                    Err(Incomplete::Dangling(_)) if is_reference(item) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_reference(
    id: EntityId,
    selected: Option<&Value>,
    entities: &EntityStore,
) -> Result<Value, Incomplete> {
    let Some(record) = entities.get(&id) else {
        return Err(Incomplete::Dangling(id));
    };
    let mut out = Map::new();
    match selected.and_then(Value::as_array) {
        Some(fields) => {
            for field in fields.iter().filter_map(Value::as_str) {
                let Some(stored) = record.get(field) else {
                    return Err(Incomplete::MissingField(id, field.to_owned()));
                };
                out.insert(field.to_owned(), denormalize(stored, entities)?);
            }
        }
        None => {
            for (field, stored) in record {
                out.insert(field.clone(), denormalize(stored, entities)?);
            }
        }
    }
    Ok(Value::Object(out))
}

fn is_reference(value: &Value) -> bool {
    value.as_object().is_some_and(|o| o.contains_key(REF_KEY))
}
