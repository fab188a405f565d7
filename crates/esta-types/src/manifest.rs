//! [`ModuleManifest`] – the external description of a loadable module.
//!
//! Manifests are persisted as JSON or TOML next to the module bytes and are
//! immutable once the module is admitted.  A new version goes through the
//! loader again.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::EstaError;
use crate::ids::ModuleId;
use crate::message::Priority;
use crate::resource::CapabilityRequest;

/// Scheduling priority as written in a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ModulePriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    /// Scheduled as `Low`, but only made runnable by its first message.
    Lazy,
}

impl ModulePriority {
    /// The scheduler/router class this priority runs in.
    pub fn class(self) -> Priority {
        match self {
            Self::Critical => Priority::Critical,
            Self::High => Priority::High,
            Self::Normal => Priority::Normal,
            Self::Low | Self::Lazy => Priority::Low,
        }
    }
}

/// What the router does when a module's mailbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Discard the incoming message; the sender sees no error.
    DropNewest,
    /// Evict the oldest queued message of the same priority class.
    DropOldest,
    /// Block the sender until space frees.
    BlockSender,
    /// Fail the send with `MailboxFull`.
    #[default]
    NotifySender,
}

/// Per-module resource quotas enforced by the scheduler and router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ResourceLimits {
    /// Linear memory ceiling in bytes handed to the sandbox.
    pub max_memory: u64,
    /// Cumulative runtime after which the module is terminated.
    pub max_execution_time_ms: u64,
    /// Mailbox capacity.
    pub max_queue_depth: usize,
    /// Outstanding `REPLY_EXPECTED` requests the module may have in flight.
    pub max_concurrent_requests: u32,
    /// Per-epoch CPU budget; `None` means unlimited.
    pub cpu_quota_ms: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory: 32 * 1024 * 1024,
            max_execution_time_ms: 60_000,
            max_queue_depth: 256,
            max_concurrent_requests: 16,
            cpu_quota_ms: None,
        }
    }
}

/// A module manifest as consumed by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleManifest {
    pub name: String,
    /// Semantic version (`1.2.3`).
    pub version: String,
    pub entry_point: String,
    /// Sandbox runtime, e.g. `wasm` or `builtin:echo`.
    pub runtime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Capability strings such as `db:read` or `messaging:send:accrual`.
    #[serde(default)]
    pub capabilities_required: Vec<String>,
    #[serde(default)]
    pub priority: ModulePriority,
    #[serde(default)]
    pub preload: bool,
    /// Hex SHA-256 of the module bytes; checked at admission when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
}

impl ModuleManifest {
    /// Minimal manifest with defaults for every optional field.
    pub fn new(name: &str, version: &str, runtime: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            entry_point: "_start".to_string(),
            runtime: runtime.to_string(),
            description: None,
            dependencies: Vec::new(),
            capabilities_required: Vec::new(),
            priority: ModulePriority::default(),
            preload: false,
            checksum: None,
            resource_limits: ResourceLimits::default(),
            backpressure: BackpressurePolicy::default(),
        }
    }

    pub fn id(&self) -> ModuleId {
        ModuleId(self.name.clone())
    }

    /// Resolve `capabilities_required` into typed requests.
    pub fn requested_capabilities(&self) -> Result<Vec<CapabilityRequest>, EstaError> {
        self.capabilities_required.iter().map(|s| s.parse()).collect()
    }

    /// Whether the module should be made runnable right after admission.
    pub fn starts_runnable(&self) -> bool {
        self.preload || self.priority != ModulePriority::Lazy
    }
}

/// JSON Schema for manifest authors and packaging tools.
pub fn manifest_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(ModuleManifest)
}
