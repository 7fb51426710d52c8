//! Operation documents, variables and fetch policies.

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Variables of an operation. Always a JSON object; absent means empty.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Stable identity of a [`Document`], derived from its source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(u64);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The kind of a GraphQL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    /// Returns the keyword introducing this operation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

/// A GraphQL operation document.
///
/// Cloning is cheap. Two documents built from the same source text share a
/// [`DocumentId`] and are interchangeable as cache and registry keys.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

struct DocumentInner {
    id: DocumentId,
    kind: OperationKind,
    operation_name: Option<String>,
    source: String,
}

impl Document {
    /// Creates a document from its source text.
    ///
    /// Only the operation header (`query Name`, `mutation Name`, ...) is
    /// inspected; the selection set is opaque to the cache.
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let (kind, operation_name) = operation_header(&source);
        let mut hasher = FxHasher::default();
        source.trim().hash(&mut hasher);
        Self {
            inner: Arc::new(DocumentInner {
                id: DocumentId(hasher.finish()),
                kind,
                operation_name,
                source,
            }),
        }
    }

    /// Returns the document identity.
    pub fn id(&self) -> DocumentId {
        self.inner.id
    }

    /// Returns the operation kind.
    pub fn kind(&self) -> OperationKind {
        self.inner.kind
    }

    /// Returns the operation name, if the operation is named.
    pub fn operation_name(&self) -> Option<&str> {
        self.inner.operation_name.as_deref()
    }

    /// Returns the source text.
    pub fn source(&self) -> &str {
        &self.inner.source
    }
}

/// Shorthand for [`Document::new`].
pub fn gql(source: &str) -> Document {
    Document::new(source)
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Document {}

impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("operation_name", &self.inner.operation_name)
            .finish()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.operation_name {
            Some(name) => write!(f, "{} {}", self.inner.kind.as_str(), name),
            None => write!(f, "anonymous {}", self.inner.kind.as_str()),
        }
    }
}

fn operation_header(source: &str) -> (OperationKind, Option<String>) {
    let body: String = source
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join(" ");
    let body = body.trim_start();

    let kind = [
        OperationKind::Query,
        OperationKind::Mutation,
        OperationKind::Subscription,
    ]
    .into_iter()
    .find(|kind| {
        body.strip_prefix(kind.as_str())
            .is_some_and(|rest| !rest.starts_with(|c: char| c.is_alphanumeric() || c == '_'))
    });

    let Some(kind) = kind else {
        // `{ ... }` shorthand
        return (OperationKind::Query, None);
    };

    let name: String = body[kind.as_str().len()..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    (kind, (!name.is_empty()).then_some(name))
}

/// Strategy governing whether a read may be served from the cache, must hit
/// the network, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Serve from the cache, fetch only on a miss.
    #[default]
    CacheFirst,
    /// Serve from the cache and always fetch to refresh it.
    CacheAndNetwork,
    /// Always fetch, write the result to the cache.
    NetworkOnly,
    /// Always fetch, never touch the cache.
    NoCache,
    /// Never fetch.
    CacheOnly,
    /// Stay idle until refetched.
    Standby,
}

impl FetchPolicy {
    /// Returns the kebab-case name, used as the prefix of registry keys.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::CacheAndNetwork => "cache-and-network",
            Self::NetworkOnly => "network-only",
            Self::NoCache => "no-cache",
            Self::CacheOnly => "cache-only",
            Self::Standby => "standby",
        }
    }

    /// Policies whose first result must come from the network even when the
    /// cache holds a complete answer.
    pub const fn bypasses_cache(&self) -> bool {
        matches!(self, Self::NetworkOnly | Self::NoCache)
    }

    /// Policies whose watches follow later cache writes. A `network-only`
    /// watch does once its first network result arrived.
    pub const fn observes_cache(&self) -> bool {
        !matches!(self, Self::NoCache)
    }

    /// Policies whose network results are stored in the cache.
    pub const fn writes_cache(&self) -> bool {
        !matches!(self, Self::NoCache)
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FetchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache-first" => Ok(Self::CacheFirst),
            "cache-and-network" => Ok(Self::CacheAndNetwork),
            "network-only" => Ok(Self::NetworkOnly),
            "no-cache" => Ok(Self::NoCache),
            "cache-only" => Ok(Self::CacheOnly),
            "standby" => Ok(Self::Standby),
            other => Err(format!("unknown fetch policy `{}`", other)),
        }
    }
}
