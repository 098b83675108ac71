//! The event registry: admission, lock acquisition, lifecycle entry points
//! and the lookup API.
//!
//! Opening an event inserts a row keyed by its target; the store's
//! primary-key uniqueness makes that insert the cluster-wide lock
//! acquisition. A conflicting insert triggers at most one expiry-reclaim
//! attempt (finalizing a stale holder on its behalf) before the conflict is
//! surfaced as [EventError::Locked] with a snapshot of the current holder.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use crate::error::EventError;
use crate::event::{CancelInfo, Event, EventId, EventRecord, Opts};
use crate::filter::{Filter, DEFAULT_LIST_LIMIT, DEFAULT_LIST_SORT};
use crate::identity::{Kind, Owner, OwnerType, Target};
use crate::lock_updater::LockUpdater;
use crate::repository::{Condition, EventRepository, FieldValue, Query, Sort, UpdateSet};
use crate::throttling::{ThrottlingRegistry, ThrottlingSpec};

/// Lock lease tuning knobs. The update interval must stay well below the
/// expire timeout; the defaults give a 10x margin.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub lock_update_interval: Duration,
    pub lock_expire_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock_update_interval: Duration::seconds(30),
            lock_expire_timeout: Duration::minutes(5),
        }
    }
}

/// Entry point for opening, finding and listing events.
#[derive(Clone)]
pub struct EventRegistry {
    repo: Arc<dyn EventRepository>,
    throttling: ThrottlingRegistry,
    updater: Arc<LockUpdater>,
    config: RegistryConfig,
}

impl EventRegistry {
    pub fn new(repo: Arc<dyn EventRepository>, config: RegistryConfig) -> Self {
        let interval = config
            .lock_update_interval
            .to_std()
            .unwrap_or(StdDuration::from_secs(30));
        let updater = Arc::new(LockUpdater::new(Arc::clone(&repo), interval));
        Self {
            repo,
            throttling: ThrottlingRegistry::new(),
            updater,
            config,
        }
    }

    /// Register an admission-control policy. Meant to be called at startup;
    /// lookups during event creation are read-only.
    pub fn set_throttling(&self, spec: ThrottlingSpec) {
        self.throttling.set(spec);
    }

    /// Open an event on behalf of an identified caller. Requires an owner
    /// (token or fully specified raw owner) and a permission-scheme kind.
    pub fn new_event(&self, opts: &Opts<'_>) -> Result<Event, EventError> {
        if opts.owner.is_none() && opts.raw_owner.is_none() {
            return Err(EventError::NoOwner);
        }
        if opts.kind.is_none() {
            return Err(EventError::NoKind);
        }
        self.new_evt(opts)
    }

    /// Open an internal event. Requires an internal kind tag and forbids the
    /// identity-token and permission-scheme fields; the owner defaults to the
    /// internal actor unless a raw owner is fully specified.
    pub fn new_internal_event(&self, opts: &Opts<'_>) -> Result<Event, EventError> {
        if opts.owner.is_some() {
            return Err(EventError::InvalidOwner);
        }
        if opts.kind.is_some() {
            return Err(EventError::InvalidKind);
        }
        if opts.internal_kind.as_deref().unwrap_or("").is_empty() {
            return Err(EventError::NoInternalKind);
        }
        self.new_evt(opts)
    }

    fn new_evt(&self, opts: &Opts<'_>) -> Result<Event, EventError> {
        self.updater.start();
        if !opts.target.is_valid() {
            return Err(EventError::NoTarget);
        }
        let kind = match (opts.kind, opts.internal_kind.as_deref()) {
            (Some(scheme), _) => Kind::permission(scheme.full_name()),
            (None, Some(tag)) if !tag.is_empty() => Kind::internal(tag),
            _ => return Err(EventError::NoKind),
        };
        let owner = match opts.owner {
            Some(token) if token.is_app_token() => Owner::new(OwnerType::App, token.app_name()),
            Some(token) => Owner::new(OwnerType::User, token.user_name()),
            None => match &opts.raw_owner {
                Some(raw) if !raw.name.is_empty() => raw.clone(),
                _ => Owner::internal(),
            },
        };
        self.check_throttling(&opts.target, &kind)?;

        let now = Utc::now();
        let record = EventRecord {
            id: EventId::Target(opts.target.clone()),
            unique_id: uuid::Uuid::new_v4().to_string(),
            start_time: now,
            end_time: None,
            target: opts.target.clone(),
            kind,
            owner,
            cancelable: opts.cancelable,
            running: true,
            lock_update_time: now,
            start_custom_data: opts.custom_data.clone(),
            end_custom_data: None,
            other_custom_data: None,
            error: String::new(),
            log: None,
            cancel_info: CancelInfo::default(),
            remove_date: None,
        };

        match self.repo.insert(&record) {
            Ok(()) => Ok(self.hold(record)),
            Err(EventError::DuplicateKey(_)) => {
                if self.reclaim_expired(&record.id) {
                    match self.repo.insert(&record) {
                        Ok(()) => Ok(self.hold(record)),
                        Err(EventError::DuplicateKey(_)) => self.locked(&record.id),
                        Err(err) => Err(err),
                    }
                } else {
                    self.locked(&record.id)
                }
            }
            Err(err) => Err(err),
        }
    }

    fn hold(&self, record: EventRecord) -> Event {
        self.updater.add(&record.target);
        Event::from_record(record, Arc::clone(&self.repo), Arc::clone(&self.updater))
    }

    fn locked(&self, id: &EventId) -> Result<Event, EventError> {
        let holder = self.repo.find_by_id(id)?;
        Err(EventError::Locked(Box::new(holder)))
    }

    fn check_throttling(&self, target: &Target, kind: &Kind) -> Result<(), EventError> {
        let Some(spec) = self.throttling.lookup(target, kind) else {
            return Ok(());
        };
        if spec.max == 0 || spec.window <= Duration::zero() {
            return Ok(());
        }
        let mut query = Query::new();
        query.push(
            "target.name",
            Condition::Eq(FieldValue::Str(target.name.clone())),
        );
        query.push(
            "target.value",
            Condition::Eq(FieldValue::Str(target.value.clone())),
        );
        query.push(
            "starttime",
            Condition::Gt(FieldValue::Time(Utc::now() - spec.window)),
        );
        if let Some(kind_name) = spec.kind_name.as_deref().filter(|name| !name.is_empty()) {
            query.push(
                "kind.name",
                Condition::Eq(FieldValue::Str(kind_name.to_string())),
            );
        }
        let recent = self.repo.count(&query)?;
        if recent >= spec.max {
            return Err(EventError::throttled(spec, target.clone()));
        }
        Ok(())
    }

    /// If the live row behind `id` has missed its heartbeat for longer than
    /// the expire timeout, finalize it on the dead holder's behalf (writing a
    /// historical twin with an expiry error) and report that the lock slot is
    /// free again.
    fn reclaim_expired(&self, id: &EventId) -> bool {
        let Ok(existing) = self.repo.find_by_id(id) else {
            return false;
        };
        let now = Utc::now();
        let deadline = existing.lock_update_time + self.config.lock_expire_timeout;
        if now <= deadline {
            return false;
        }
        let stale_for = now - existing.lock_update_time;
        let message = format!("event expired, no update for {}s", stale_for.num_seconds());
        let handle = Event::from_record(
            existing,
            Arc::clone(&self.repo),
            Arc::clone(&self.updater),
        );
        // Best-effort: if finalizing fails the retry insert conflicts again
        // and the caller observes Locked.
        let _ = handle.done(Some(&message));
        true
    }

    /// The single live event for a target and kind name.
    pub fn get_running(&self, target: &Target, kind_name: &str) -> Result<Event, EventError> {
        let mut query = Query::by_id(&EventId::Target(target.clone()));
        query.push(
            "kind.name",
            Condition::Eq(FieldValue::Str(kind_name.to_string())),
        );
        query.push("running", Condition::Eq(FieldValue::Bool(true)));
        let record = self.repo.find_one(&query)?;
        Ok(Event::from_record(
            record,
            Arc::clone(&self.repo),
            Arc::clone(&self.updater),
        ))
    }

    /// The event (live or historical) with the given unique id.
    pub fn get_by_id(&self, unique_id: &str) -> Result<Event, EventError> {
        let mut query = Query::new();
        query.push(
            "uniqueid",
            Condition::Eq(FieldValue::Str(unique_id.to_string())),
        );
        let record = self.repo.find_one(&query)?;
        Ok(Event::from_record(
            record,
            Arc::clone(&self.repo),
            Arc::clone(&self.updater),
        ))
    }

    /// List events matching the filter, newest first by default. Without a
    /// filter everything is returned, soft-removed rows included.
    pub fn list(&self, filter: Option<&Filter>) -> Result<Vec<EventRecord>, EventError> {
        let (query, limit, skip, sort) = match filter {
            Some(filter) => (
                filter.to_query(),
                if filter.limit != 0 {
                    filter.limit
                } else {
                    DEFAULT_LIST_LIMIT
                },
                filter.skip,
                Sort::parse(filter.sort.as_deref().unwrap_or(DEFAULT_LIST_SORT)),
            ),
            None => (Query::new(), DEFAULT_LIST_LIMIT, 0, Sort::default()),
        };
        self.repo.list(&query, &sort, limit, skip)
    }

    pub fn all(&self) -> Result<Vec<EventRecord>, EventError> {
        self.list(None)
    }

    /// Soft-delete every non-removed row for the target (live and
    /// historical), hiding them from default list results. Returns the
    /// number of rows marked.
    pub fn mark_as_removed(&self, target: &Target) -> Result<u64, EventError> {
        let mut query = Query::new();
        query.push(
            "target.name",
            Condition::Eq(FieldValue::Str(target.name.clone())),
        );
        query.push(
            "target.value",
            Condition::Eq(FieldValue::Str(target.value.clone())),
        );
        query.push("removedate", Condition::Exists(false));
        let update = UpdateSet::new().set("removedate", FieldValue::Time(Utc::now()));
        self.repo.update_many(&query, &update)
    }

    /// Stop the heartbeat worker. Held locks will expire unless a later
    /// event creation restarts it.
    pub fn shutdown(&self) {
        self.updater.stop();
    }
}
