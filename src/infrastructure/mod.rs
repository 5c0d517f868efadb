//! Infrastructure layer: the external collaborators the engine talks to,
//! with in-process implementations.
//!
//! - [`BudgetAuthority`]: tenant budget checks and spend recording.
//! - [`CacheStore`]: key-value store behind the cache middleware.
//! - [`ExecutionSink`]: destination for per-attempt execution records.
//! - [`Notifier`]: best-effort delivery of approval notifications.

pub mod budget;
pub mod cache_store;
pub mod notify;
pub mod sink;

pub use budget::{
    BudgetAuthority, BudgetError, Enforcement, InMemoryBudgetAuthority, TenantBudget, TenantSpend,
};
pub use cache_store::{CacheStats, CacheStore, InMemoryCacheStore};
pub use notify::{
    InMemoryNotifier, Notification, NotificationKind, Notifier, NotifyError, TracingNotifier,
};
pub use sink::{ChannelExecutionSink, ExecutionSink, InMemoryExecutionSink, TracingExecutionSink};
