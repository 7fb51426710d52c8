//! Errors raised by the binding runtime.

use gqlbind_cache::QueryError;
use thiserror::Error;

/// Binding runtime errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindError {
    /// A render-phase operation was called outside the render phase.
    #[error("`{operation}` is only permitted during the render phase")]
    CapabilityViolation { operation: &'static str },

    /// The definition set has no entry for this key.
    #[error("no named query definition `{key}`")]
    UnknownDefinition { key: String },

    /// The query behind a read failed.
    #[error(transparent)]
    QueryFailure(#[from] QueryError),

    /// An entity passed to `write_entity` or `evict` has no cache identity.
    #[error("entity cannot be identified: {entity}")]
    UnidentifiedEntity { entity: String },

    /// The cache adapter behind a registry was dropped.
    #[error("the cache adapter was dropped")]
    AdapterDropped,

    /// Query data does not match the requested type.
    #[error("failed to decode query data: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for BindError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl BindError {
    /// Creates an unknown definition error.
    pub fn unknown_definition(key: impl Into<String>) -> Self {
        Self::UnknownDefinition { key: key.into() }
    }

    /// Returns the query error behind a [`BindError::QueryFailure`].
    pub fn query_error(&self) -> Option<&QueryError> {
        match self {
            Self::QueryFailure(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type for binding runtime operations.
pub type BindResult<T> = Result<T, BindError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BindError::CapabilityViolation { operation: "get" };
        assert_eq!(err.to_string(), "`get` is only permitted during the render phase");

        let err = BindError::unknown_definition("todoList");
        assert_eq!(err.to_string(), "no named query definition `todoList`");

        let err: BindError = QueryError::network("offline").into();
        assert_eq!(err.to_string(), "[NETWORK_ERROR] offline");
        assert!(err.query_error().is_some());

        assert_eq!(BindError::AdapterDropped.to_string(), "the cache adapter was dropped");
    }

    #[test]
    fn test_decode_error_conversion() {
        let err: BindError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(matches!(err, BindError::Decode(_)));
    }
}
