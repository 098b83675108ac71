//! Error surface of the event registry.
//!
//! Validation and admission errors are returned before any side effect;
//! contention surfaces as [EventError::Locked] with a snapshot of the current
//! holder; store failures pass through as [EventError::Storage] except
//! "no such document", which the repository translates to
//! [EventError::NotFound].

use std::fmt;

use chrono::Duration;

use crate::event::EventRecord;
use crate::identity::Target;
use crate::throttling::ThrottlingSpec;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event is not cancelable")]
    NotCancelable,
    #[error("event not found")]
    NotFound,
    #[error("event target is mandatory")]
    NoTarget,
    #[error("event kind is mandatory")]
    NoKind,
    #[error("event owner is mandatory")]
    NoOwner,
    #[error("event opts is mandatory")]
    NoOpts,
    #[error("event internal kind is mandatory")]
    NoInternalKind,
    #[error("event owner must not be set on internal events")]
    InvalidOwner,
    #[error("event kind must not be set on internal events")]
    InvalidKind,
    /// Admission rejected: the throttling policy for the target was breached.
    #[error("{0}")]
    Throttled(ThrottledError),
    /// The target is locked by the embedded live event.
    #[error("event locked: {0}")]
    Locked(Box<EventRecord>),
    /// Primary-key conflict on insert. Internal contention signal consumed by
    /// the lock acquirer; callers observe [EventError::Locked] instead.
    #[error("duplicate event id: {0}")]
    DuplicateKey(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EventError {
    pub fn throttled(spec: ThrottlingSpec, target: Target) -> Self {
        Self::Throttled(ThrottledError { spec, target })
    }
}

/// Carries the policy breached and the target it was breached for.
#[derive(Clone, Debug)]
pub struct ThrottledError {
    pub spec: ThrottlingSpec,
    pub target: Target,
}

impl fmt::Display for ThrottledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let extra = match &self.spec.kind_name {
            Some(kind) if !kind.is_empty() => format!(" {} on", kind),
            _ => String::new(),
        };
        write!(
            f,
            "event throttled, limit for{} {} {:?} is {} every {}",
            extra,
            self.target.name,
            self.target.value,
            self.spec.max,
            fmt_window(self.spec.window),
        )
    }
}

fn fmt_window(window: Duration) -> String {
    let secs = window.num_seconds();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
