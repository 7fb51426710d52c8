//! Cache layer for gqlbind.
//!
//! This crate provides the collaborators the binding runtime consumes:
//! - `adapter`: The cache adapter and watched query contracts
//! - `cache`: Normalized in-memory cache
//! - `client`: Cache adapter broadcasting changes to live queries
//! - `canonical`: Canonical JSON serialization and deep equality
//! - `document`: Operation documents, variables and fetch policies
//! - `error`: Query errors
//! - `normalize`: Entity identification and normalization
//! - `transport`: Transport contract and mock transport

pub mod adapter;
pub mod cache;
pub mod canonical;
pub mod client;
pub mod document;
pub mod error;
pub mod normalize;
pub mod transport;

pub use adapter::{
    AdapterSlot, BoxFuture, CacheAdapter, FieldModifier, FieldModifiers, Observer, OperationResult,
    WatchQuery, WatchSubscription,
};
pub use cache::InMemoryCache;
pub use canonical::{canonical_json, deep_equal, is_empty_data};
pub use client::{Client, ObservableQuery};
pub use document::{gql, Document, DocumentId, FetchPolicy, OperationKind, Variables};
pub use error::{ErrorCode, QueryError};
pub use normalize::{identify, EntityId};
pub use transport::{MockResolver, MockTransport, MockTransportConfig, Request, Transport};
