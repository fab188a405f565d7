//! Resource references and manifest capability strings.
//!
//! A manifest requests capabilities with strings of the form
//! `resource:action[+action...][:pattern]`:
//!
//! | String | Resource | Rights | Pattern |
//! |---|---|---|---|
//! | `db:read` | `Database` | `READ` | `*` |
//! | `messaging:send:accrual` | `Channel` | `SEND` | `accrual` |
//! | `file:read+write:reports/*` | `File` | `READ \| WRITE` | `reports/*` |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EstaError;
use crate::rights::Rights;

/// Kinds of resources a capability can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Channel,
    File,
    Database,
    Process,
    AuditLog,
    Config,
    Timer,
    Network,
}

impl ResourceKind {
    /// Resolve the resource half of a capability string.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        let kind = match prefix.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Self::Memory,
            "channel" | "messaging" | "ipc" => Self::Channel,
            "file" | "fs" => Self::File,
            "db" | "database" => Self::Database,
            "process" | "proc" => Self::Process,
            "audit" | "audit_log" => Self::AuditLog,
            "config" => Self::Config,
            "timer" | "clock" | "time" => Self::Timer,
            "network" | "net" | "http" => Self::Network,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Channel => "channel",
            Self::File => "file",
            Self::Database => "db",
            Self::Process => "process",
            Self::AuditLog => "audit",
            Self::Config => "config",
            Self::Timer => "timer",
            Self::Network => "network",
        }
    }
}

/// A typed resource plus an opaque pattern used for match-based authorization.
///
/// Pattern rules: `*` (or empty) matches everything, a trailing `*` is a
/// prefix match, anything else must match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub pattern: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, pattern: impl Into<String>) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
        }
    }

    /// Every resource of `kind`.
    pub fn any(kind: ResourceKind) -> Self {
        Self::new(kind, "*")
    }

    /// The channel resource of a named mailbox.
    pub fn channel(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Channel, name)
    }

    /// `true` when `self` (a held or authorized resource) covers `wanted`.
    ///
    /// A wanted pattern that is itself a prefix (`ledger/*`) is covered only
    /// by a held pattern at least as broad.
    pub fn covers(&self, wanted: &ResourceRef) -> bool {
        self.kind == wanted.kind && pattern_covers(&self.pattern, &wanted.pattern)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.pattern)
    }
}

fn pattern_covers(held: &str, wanted: &str) -> bool {
    if held.is_empty() || held == "*" {
        return true;
    }
    match held.strip_suffix('*') {
        Some(prefix) => {
            let wanted_base = wanted.strip_suffix('*').unwrap_or(wanted);
            wanted_base.starts_with(prefix)
        }
        None => held == wanted,
    }
}

/// A typed capability request resolved from a manifest string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub resource: ResourceRef,
    pub rights: Rights,
}

impl CapabilityRequest {
    pub fn new(resource: ResourceRef, rights: Rights) -> Self {
        Self { resource, rights }
    }
}

impl FromStr for CapabilityRequest {
    type Err = EstaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| EstaError::InvalidCapability(format!("{s:?}: {why}"));

        let mut parts = s.splitn(3, ':');
        let kind_str = parts.next().unwrap_or_default();
        let actions = parts.next().ok_or_else(|| invalid("expected resource:action"))?;
        let pattern = parts.next().unwrap_or("*");

        let kind = ResourceKind::from_prefix(kind_str).ok_or_else(|| invalid("unknown resource"))?;

        let mut rights = Rights::empty();
        for action in actions.split(['+', ',']) {
            rights |= Rights::from_action(action).ok_or_else(|| invalid("unknown action"))?;
        }
        if pattern.trim().is_empty() {
            return Err(invalid("empty pattern"));
        }

        Ok(Self {
            resource: ResourceRef::new(kind, pattern.trim()),
            rights,
        })
    }
}

impl fmt::Display for CapabilityRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource.kind.as_str(),
            self.rights.names().join("+"),
            self.resource.pattern
        )
    }
}
