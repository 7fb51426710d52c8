//! Query orchestration runtime for gqlbind.
//!
//! This crate binds host components to cached GraphQL queries:
//! - `registry`: Deduplicated query handles per cache adapter
//! - `handle`: Query handle state machine and completions
//! - `disposal`: Grace-period disposal queue
//! - `orchestrator`: Render-phase reads, writes with rollback, refetch
//! - `session`: Render lifecycle of one host component
//! - `definition`: Named query definitions
//! - `resolution`: Ready or pending read outcomes
//! - `config`: Runtime configuration
//! - `error`: Binding errors

pub mod config;
pub mod definition;
pub mod disposal;
pub mod error;
pub mod handle;
pub mod orchestrator;
pub mod registry;
pub mod resolution;
pub mod session;

pub use config::RuntimeConfig;
pub use definition::{Definitions, QueryArg, QueryDefinition};
pub use disposal::{DisposalQueue, DisposalScheduler, TaskId};
pub use error::{BindError, BindResult};
pub use handle::{Completion, Listener, ListenerGuard, QueryHandle, QueryStatus};
pub use orchestrator::{FieldChanges, FieldUpdate, Orchestrator, RefetchTarget, Rollback, Update};
pub use registry::{query_key, Registry};
pub use resolution::{PendingSet, Resolution};
pub use session::{BindingSession, RenderPhase};
