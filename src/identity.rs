//! Identity types: the target a lock protects, the actor that caused an
//! event, and the kind that classifies it.
//!
//! A [Target] doubles as the lock key while an event is live, so its
//! serialized form must be field-order stable (`name` before `value`); the
//! store compares composite keys order-sensitively.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Named resource under administrative operation (e.g. `app` / `myservice`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub value: String,
}

impl Target {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Both components are mandatory for a target to act as a lock key.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.value.is_empty()
    }
}

/// Type of the actor that caused an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    User,
    App,
    Internal,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::App => "app",
            Self::Internal => "internal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "app" => Some(Self::App),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for OwnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Causal actor of an event. Internal owners may have an empty name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    #[serde(rename = "type")]
    pub owner_type: OwnerType,
    pub name: String,
}

impl Owner {
    pub fn new(owner_type: OwnerType, name: impl Into<String>) -> Self {
        Self {
            owner_type,
            name: name.into(),
        }
    }

    pub fn internal() -> Self {
        Self {
            owner_type: OwnerType::Internal,
            name: String::new(),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.owner_type, self.name)
    }
}

/// Type of an event kind: derived from a permission scheme, or an internal
/// caller-supplied tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindType {
    Permission,
    Internal,
}

impl KindType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permission => "permission",
            Self::Internal => "internal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "permission" => Some(Self::Permission),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for KindType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kind {
    #[serde(rename = "type")]
    pub kind_type: KindType,
    pub name: String,
}

impl Kind {
    pub fn permission(name: impl Into<String>) -> Self {
        Self {
            kind_type: KindType::Permission,
            name: name.into(),
        }
    }

    pub fn internal(name: impl Into<String>) -> Self {
        Self {
            kind_type: KindType::Internal,
            name: name.into(),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identity token supplied by the external authentication module.
pub trait Token {
    fn is_app_token(&self) -> bool;
    fn app_name(&self) -> String;
    fn user_name(&self) -> String;
}

/// Permission scheme supplied by the external permission module; its full
/// name becomes the kind name of permission-scoped events.
pub trait PermissionScheme {
    fn full_name(&self) -> String;
}
