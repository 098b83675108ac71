//! Persistent audit-and-lock registry for administrative operations.
//!
//! Every operation against a named target opens an [Event], which records a
//! durable audit trail and simultaneously locks its [Target] across the
//! cluster: the store's uniqueness constraint on the target-keyed row is the
//! lock. Held locks are kept alive by a batching heartbeat worker and expire
//! when their holder dies; completed events are swapped for historical rows
//! keyed by their permanent unique id.
//!
//! Open events through an [EventRegistry] over an [EventRepository]
//! (SQLite-backed by default), drive the handle (logs, custom data,
//! cancellation handshake), and finalize it with [Event::done] or
//! [Event::abort].

pub mod error;
pub mod event;
pub mod filter;
pub mod identity;
pub mod lock_updater;
pub mod registry;
pub mod repository;
pub mod sqlite_repository;
pub mod throttling;

pub use error::{EventError, ThrottledError};
pub use event::{CancelInfo, Event, EventId, EventLogSink, EventRecord, Opts};
pub use filter::{Filter, DEFAULT_LIST_LIMIT, DEFAULT_LIST_SORT};
pub use identity::{Kind, KindType, Owner, OwnerType, PermissionScheme, Target, Token};
pub use lock_updater::LockUpdater;
pub use registry::{EventRegistry, RegistryConfig};
pub use repository::{Condition, EventRepository, FieldValue, Query, Sort, UpdateSet};
pub use sqlite_repository::SqliteEventRepository;
pub use throttling::{ThrottlingRegistry, ThrottlingSpec};
