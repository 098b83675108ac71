//! Admission-control policies limiting event creation rate per target,
//! optionally scoped to a kind.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Duration;

use crate::identity::{Kind, Target};

/// Rate limit for event creation: at most `max` events per `window` for a
/// target name, optionally narrowed to one kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThrottlingSpec {
    pub target_name: String,
    pub kind_name: Option<String>,
    pub max: usize,
    pub window: Duration,
}

impl ThrottlingSpec {
    fn key(&self) -> String {
        spec_key(&self.target_name, self.kind_name.as_deref())
    }
}

fn spec_key(target_name: &str, kind_name: Option<&str>) -> String {
    match kind_name {
        Some(kind) if !kind.is_empty() => format!("{}_{}", target_name, kind),
        _ => target_name.to_string(),
    }
}

/// Shared map of throttling specs, populated at startup and read-only during
/// event creation. Lookup prefers a kind-scoped spec over a target-scoped one.
#[derive(Clone, Debug, Default)]
pub struct ThrottlingRegistry {
    specs: Arc<RwLock<HashMap<String, ThrottlingSpec>>>,
}

impl ThrottlingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, spec: ThrottlingSpec) {
        let key = spec.key();
        if let Ok(mut specs) = self.specs.write() {
            specs.insert(key, spec);
        }
    }

    pub fn lookup(&self, target: &Target, kind: &Kind) -> Option<ThrottlingSpec> {
        let specs = self.specs.read().ok()?;
        if let Some(spec) = specs.get(&spec_key(&target.name, Some(&kind.name))) {
            return Some(spec.clone());
        }
        specs.get(&spec_key(&target.name, None)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(target: &str, kind: Option<&str>, max: usize) -> ThrottlingSpec {
        ThrottlingSpec {
            target_name: target.to_string(),
            kind_name: kind.map(str::to_string),
            max,
            window: Duration::hours(1),
        }
    }

    #[test]
    fn lookup_prefers_kind_scoped_spec() {
        let registry = ThrottlingRegistry::new();
        registry.set(spec("app", None, 5));
        registry.set(spec("app", Some("app.update"), 2));

        let target = Target::new("app", "web");
        let found = registry
            .lookup(&target, &Kind::permission("app.update"))
            .expect("kind-scoped spec");
        assert_eq!(found.max, 2);
    }

    #[test]
    fn lookup_falls_back_to_target_scoped_spec() {
        let registry = ThrottlingRegistry::new();
        registry.set(spec("app", None, 5));

        let target = Target::new("app", "web");
        let found = registry
            .lookup(&target, &Kind::permission("app.deploy"))
            .expect("target-scoped spec");
        assert_eq!(found.max, 5);
        assert_eq!(found.kind_name, None);
    }

    #[test]
    fn lookup_without_matching_spec_is_none() {
        let registry = ThrottlingRegistry::new();
        registry.set(spec("node", None, 1));

        let target = Target::new("app", "web");
        assert!(registry.lookup(&target, &Kind::internal("gc")).is_none());
    }

    #[test]
    fn set_and_lookup_share_one_key_format() {
        let registry = ThrottlingRegistry::new();
        registry.set(spec("app", Some("app.update"), 3));

        let target = Target::new("app", "a");
        assert!(registry
            .lookup(&target, &Kind::permission("app.update"))
            .is_some());
        // An empty kind name in the spec degrades to the target-scoped key.
        registry.set(spec("pool", Some(""), 4));
        let pool = Target::new("pool", "p1");
        let found = registry
            .lookup(&pool, &Kind::internal("resize"))
            .expect("target-scoped entry");
        assert_eq!(found.max, 4);
    }
}
