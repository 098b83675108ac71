//! Storage contract for the persisted event collection.
//!
//! [EventRepository] is the typed facade callers go through; implementations
//! are responsible for making the lock protocol's store obligations explicit:
//! - `insert` must be an atomic insert-or-fail on the `_id` key and report a
//!   conflict as [EventError::DuplicateKey] — the uniqueness of the
//!   target-valued id is the cluster-wide lock.
//! - "no such document" is translated to [EventError::NotFound]; every other
//!   store failure passes through as [EventError::Storage].
//! - `find_and_modify` applies the update and returns the new document state
//!   atomically with respect to other writers.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::EventError;
use crate::event::{EventId, EventRecord};

/// Scalar or opaque value usable in query conditions and field updates.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Time(DateTime<Utc>),
    Json(Value),
    Null,
}

/// Single-field predicate of an abstract query.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Eq(FieldValue),
    Gt(FieldValue),
    Gte(FieldValue),
    Lte(FieldValue),
    In(Vec<FieldValue>),
    Exists(bool),
}

/// Abstract conjunctive query over event field paths (`"target.name"`,
/// `"starttime"`, `"running"`, ...). Clause order is preserved; [Query::set]
/// replaces every prior clause for the same field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    clauses: Vec<(String, Condition)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a single document by primary key.
    pub fn by_id(id: &EventId) -> Self {
        let mut query = Self::new();
        query.push("_id", Condition::Eq(FieldValue::Str(id.storage_key())));
        query
    }

    /// Append a clause, keeping any earlier clause on the same field (used
    /// for range bounds that share a field).
    pub fn push(&mut self, field: impl Into<String>, condition: Condition) -> &mut Self {
        self.clauses.push((field.into(), condition));
        self
    }

    /// Insert a clause, overwriting every earlier clause on the same field.
    pub fn set(&mut self, field: impl Into<String>, condition: Condition) -> &mut Self {
        let field = field.into();
        self.clauses.retain(|(existing, _)| *existing != field);
        self.clauses.push((field, condition));
        self
    }

    pub fn clauses(&self) -> &[(String, Condition)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

/// Set-style update over event field paths.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateSet {
    sets: Vec<(String, FieldValue)>,
}

impl UpdateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.sets.push((field.into(), value));
        self
    }

    pub fn sets(&self) -> &[(String, FieldValue)] {
        &self.sets
    }
}

/// Sort order for list queries. The textual form mirrors the filter surface:
/// `"starttime"` ascending, `"-starttime"` descending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub descending: bool,
}

impl Sort {
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(field) => Self {
                field: field.to_string(),
                descending: true,
            },
            None => Self {
                field: spec.to_string(),
                descending: false,
            },
        }
    }
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            field: "starttime".to_string(),
            descending: true,
        }
    }
}

/// Typed CRUD over the persisted event collection.
pub trait EventRepository: Send + Sync {
    fn insert(&self, record: &EventRecord) -> Result<(), EventError>;

    fn find_by_id(&self, id: &EventId) -> Result<EventRecord, EventError>;

    /// First document matching the query, or [EventError::NotFound].
    fn find_one(&self, query: &Query) -> Result<EventRecord, EventError>;

    /// Apply `update` to the single document matching `query` and return the
    /// new document state. [EventError::NotFound] if nothing matches.
    fn find_and_modify(&self, query: &Query, update: &UpdateSet)
        -> Result<EventRecord, EventError>;

    /// Update the document with the given id. [EventError::NotFound] if absent.
    fn update_one(&self, id: &EventId, update: &UpdateSet) -> Result<(), EventError>;

    /// Update every document matching the query; returns the match count.
    fn update_many(&self, query: &Query, update: &UpdateSet) -> Result<u64, EventError>;

    fn remove_by_id(&self, id: &EventId) -> Result<(), EventError>;

    fn count(&self, query: &Query) -> Result<usize, EventError>;

    /// Query with sort, limit and skip. `limit == 0` means unbounded.
    fn list(
        &self,
        query: &Query,
        sort: &Sort,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<EventRecord>, EventError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_every_clause_for_the_field() {
        let mut query = Query::new();
        query.push("starttime", Condition::Gte(FieldValue::Int(1)));
        query.push("starttime", Condition::Lte(FieldValue::Int(9)));
        query.push("running", Condition::Eq(FieldValue::Bool(true)));
        query.set("starttime", Condition::Eq(FieldValue::Int(5)));

        assert_eq!(
            query.clauses(),
            &[
                (
                    "running".to_string(),
                    Condition::Eq(FieldValue::Bool(true))
                ),
                ("starttime".to_string(), Condition::Eq(FieldValue::Int(5))),
            ]
        );
    }

    #[test]
    fn sort_parses_leading_dash_as_descending() {
        assert_eq!(
            Sort::parse("-starttime"),
            Sort {
                field: "starttime".to_string(),
                descending: true
            }
        );
        assert_eq!(
            Sort::parse("endtime"),
            Sort {
                field: "endtime".to_string(),
                descending: false
            }
        );
        assert_eq!(Sort::default(), Sort::parse("-starttime"));
    }
}
