//! Translation of a structured [Filter] into the abstract store [Query].

use chrono::{DateTime, Utc};

use crate::identity::{KindType, OwnerType};
use crate::repository::{Condition, FieldValue, Query};

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const DEFAULT_LIST_SORT: &str = "-starttime";

/// Structured lookup filter. Every field is optional; `raw` is an escape
/// hatch merged last, overwriting synthesized clauses on field collision.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub target_name: Option<String>,
    pub target_value: Option<String>,
    pub kind_type: Option<KindType>,
    pub kind_name: Option<String>,
    pub owner_type: Option<OwnerType>,
    pub owner_name: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub running: Option<bool>,
    pub include_removed: bool,
    pub raw: Vec<(String, Condition)>,

    /// `0` means the default of [DEFAULT_LIST_LIMIT].
    pub limit: usize,
    pub skip: usize,
    /// `None` means the default of [DEFAULT_LIST_SORT].
    pub sort: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    pub fn with_target_value(mut self, value: impl Into<String>) -> Self {
        self.target_value = Some(value.into());
        self
    }

    pub fn with_kind_name(mut self, name: impl Into<String>) -> Self {
        self.kind_name = Some(name.into());
        self
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.running = Some(running);
        self
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn to_query(&self) -> Query {
        let mut query = Query::new();
        if let Some(name) = non_empty(&self.target_name) {
            query.push("target.name", Condition::Eq(FieldValue::Str(name)));
        }
        if let Some(value) = non_empty(&self.target_value) {
            query.push("target.value", Condition::Eq(FieldValue::Str(value)));
        }
        if let Some(kind_type) = self.kind_type {
            query.push(
                "kind.type",
                Condition::Eq(FieldValue::Str(kind_type.as_str().to_string())),
            );
        }
        if let Some(name) = non_empty(&self.kind_name) {
            query.push("kind.name", Condition::Eq(FieldValue::Str(name)));
        }
        if let Some(owner_type) = self.owner_type {
            query.push(
                "owner.type",
                Condition::Eq(FieldValue::Str(owner_type.as_str().to_string())),
            );
        }
        if let Some(name) = non_empty(&self.owner_name) {
            query.push("owner.name", Condition::Eq(FieldValue::Str(name)));
        }
        if let Some(since) = self.since {
            query.push("starttime", Condition::Gte(FieldValue::Time(since)));
        }
        if let Some(until) = self.until {
            query.push("starttime", Condition::Lte(FieldValue::Time(until)));
        }
        if let Some(running) = self.running {
            query.push("running", Condition::Eq(FieldValue::Bool(running)));
        }
        if !self.include_removed {
            query.push("removedate", Condition::Exists(false));
        }
        for (field, condition) in &self.raw {
            query.set(field.clone(), condition.clone());
        }
        query
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn empty_filter_only_excludes_removed() {
        let query = Filter::new().to_query();
        assert_eq!(
            query.clauses(),
            &[("removedate".to_string(), Condition::Exists(false))]
        );
    }

    #[test]
    fn include_removed_drops_the_removedate_clause() {
        let mut filter = Filter::new();
        filter.include_removed = true;
        assert!(filter.to_query().is_empty());
    }

    #[test]
    fn since_and_until_both_bound_starttime() {
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let query = Filter::new().with_since(since).with_until(until).to_query();
        let starttime_clauses: Vec<_> = query
            .clauses()
            .iter()
            .filter(|(field, _)| field == "starttime")
            .collect();
        assert_eq!(starttime_clauses.len(), 2);
        assert_eq!(
            starttime_clauses[0].1,
            Condition::Gte(FieldValue::Time(since))
        );
        assert_eq!(
            starttime_clauses[1].1,
            Condition::Lte(FieldValue::Time(until))
        );
    }

    #[test]
    fn raw_entries_overwrite_synthesized_clauses() {
        let mut filter = Filter::new().with_running(true);
        filter.raw.push((
            "running".to_string(),
            Condition::Eq(FieldValue::Bool(false)),
        ));
        let query = filter.to_query();
        let running: Vec<_> = query
            .clauses()
            .iter()
            .filter(|(field, _)| field == "running")
            .collect();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].1, Condition::Eq(FieldValue::Bool(false)));
    }

    #[test]
    fn empty_string_components_are_ignored() {
        let query = Filter::new()
            .with_target_name("app")
            .with_target_value("")
            .to_query();
        assert!(query
            .clauses()
            .iter()
            .all(|(field, _)| field != "target.value"));
        assert!(query
            .clauses()
            .iter()
            .any(|(field, _)| field == "target.name"));
    }
}
