//! Named query definitions.

use gqlbind_cache::{Document, FetchPolicy, Variables};
use indexmap::IndexMap;

/// A query a binding session can read by name.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDefinition {
    pub document: Document,
    pub variables: Variables,
    /// `None` uses the registry's default fetch policy.
    pub fetch_policy: Option<FetchPolicy>,
}

impl QueryDefinition {
    /// Creates a definition without variables.
    pub fn new(document: Document) -> Self {
        Self {
            document,
            variables: Variables::new(),
            fetch_policy: None,
        }
    }

    /// Sets the variables.
    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Sets one variable.
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Sets the fetch policy.
    pub fn fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.fetch_policy = Some(policy);
        self
    }

    /// Returns a copy whose variables are shallowly overridden.
    pub fn with_overrides(&self, overrides: &Variables) -> Self {
        let mut definition = self.clone();
        for (name, value) in overrides {
            definition.variables.insert(name.clone(), value.clone());
        }
        definition
    }

    /// The fetch policy, falling back to `default`.
    pub fn effective_policy(&self, default: FetchPolicy) -> FetchPolicy {
        self.fetch_policy.unwrap_or(default)
    }
}

/// Named definitions, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Definitions(IndexMap<String, QueryDefinition>);

impl Definitions {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition.
    pub fn with(mut self, key: impl Into<String>, definition: QueryDefinition) -> Self {
        self.insert(key, definition);
        self
    }

    /// Adds or replaces a definition.
    pub fn insert(&mut self, key: impl Into<String>, definition: QueryDefinition) {
        self.0.insert(key.into(), definition);
    }

    pub fn get(&self, key: &str) -> Option<&QueryDefinition> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, QueryDefinition)> for Definitions {
    fn from_iter<I: IntoIterator<Item = (K, QueryDefinition)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, d)| (k.into(), d)).collect())
    }
}

/// One argument of a read: a definition key, optionally with variable
/// overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryArg {
    key: String,
    overrides: Option<Variables>,
}

impl QueryArg {
    /// Reads the definition as declared.
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            overrides: None,
        }
    }

    /// Reads the definition with some variables overridden.
    pub fn with_variables(key: impl Into<String>, overrides: Variables) -> Self {
        Self {
            key: key.into(),
            overrides: Some(overrides),
        }
    }

    /// The definition key.
    pub fn name(&self) -> &str {
        &self.key
    }

    /// The variable overrides.
    pub fn overrides(&self) -> Option<&Variables> {
        self.overrides.as_ref()
    }
}

impl From<&str> for QueryArg {
    fn from(key: &str) -> Self {
        Self::key(key)
    }
}

impl From<String> for QueryArg {
    fn from(key: String) -> Self {
        Self::key(key)
    }
}
