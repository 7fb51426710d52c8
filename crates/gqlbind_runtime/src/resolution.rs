//! Outcome of a render-phase read.

use gqlbind_cache::QueryError;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::BindResult;
use crate::handle::Completion;

/// A read either has all its data or must wait for some queries.
#[derive(Debug)]
pub enum Resolution<T> {
    /// Every query has settled.
    Ready(T),
    /// Some queries are still loading. Wait for them, then render again.
    Pending(PendingSet),
}

impl<T> Resolution<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// The value, if ready.
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::Pending(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Self::Ready(value) => Resolution::Ready(f(value)),
            Self::Pending(pending) => Resolution::Pending(pending),
        }
    }
}

impl Resolution<Value> {
    /// Decodes ready data into `T`.
    pub fn decode<T: DeserializeOwned>(self) -> BindResult<Resolution<T>> {
        match self {
            Self::Ready(value) => Ok(Resolution::Ready(serde_json::from_value(value)?)),
            Self::Pending(pending) => Ok(Resolution::Pending(pending)),
        }
    }
}

/// Completions a suspended read is waiting on.
#[derive(Debug, Default)]
pub struct PendingSet {
    completions: Vec<Completion>,
}

impl PendingSet {
    pub(crate) fn new(completions: Vec<Completion>) -> Self {
        Self { completions }
    }

    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }

    /// Waits until every completion settled, successfully or not. Failures
    /// surface on the next read.
    pub async fn settled(self) {
        for completion in self.completions {
            let _ = completion.wait().await;
        }
    }

    /// Waits for every completion, stopping at the first failure.
    pub async fn wait_all(self) -> Result<Vec<Value>, QueryError> {
        let mut values = Vec::with_capacity(self.completions.len());
        for completion in self.completions {
            values.push(completion.wait().await?);
        }
        Ok(values)
    }
}
