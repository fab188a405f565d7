use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{CapabilityId, ProcessId};

/// Global error type spanning authorization, IPC backpressure, scheduling
/// quotas, admission and audit integrity.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstaError {
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("Capability request denied: {reason}")]
    Denied { reason: String },

    #[error("Attenuation violation: requested {requested:?}, held {held:?}")]
    AttenuationViolation {
        requested: Vec<String>,
        held: Vec<String>,
    },

    #[error("Capability {0} has been revoked")]
    RevokedCapability(CapabilityId),

    #[error("Unknown capability {0}")]
    UnknownCapability(CapabilityId),

    #[error("Invalid capability string {0}")]
    InvalidCapability(String),

    #[error("Mailbox of {target} is full")]
    MailboxFull { target: ProcessId },

    #[error("Execution quota exceeded by {pid}")]
    QuotaExceeded { pid: ProcessId },

    #[error("Invalid signature for module {module}")]
    InvalidSignature { module: String },

    #[error("Module {module} depends on unresolved module {dependency}")]
    UnresolvedDependency { module: String, dependency: String },

    #[error("Dependency cycle between modules {modules:?}")]
    DependencyCycle { modules: Vec<String> },

    #[error("Invalid manifest for {module}: {reason}")]
    InvalidManifest { module: String, reason: String },

    #[error("Module {module} is already admitted")]
    AlreadyAdmitted { module: String },

    #[error("Unsupported runtime {0:?}")]
    UnsupportedRuntime(String),

    #[error("Audit chain corrupted at sequence {sequence}")]
    AuditChainCorruption { sequence: u64 },

    #[error("Module {pid} has been terminated")]
    ModuleTerminated { pid: ProcessId },

    #[error("Unknown process {0}")]
    UnknownProcess(ProcessId),

    #[error("Illegal transition for {pid}: {from} -> {to}")]
    InvalidTransition {
        pid: ProcessId,
        from: String,
        to: String,
    },

    #[error("Payload of {size} bytes exceeds the 1 MiB limit")]
    PayloadTooLarge { size: usize },

    #[error("Wire format error: {0}")]
    Wire(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EstaError {
    /// Security violations are never retried and are always audited.
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. }
                | Self::Denied { .. }
                | Self::AttenuationViolation { .. }
                | Self::RevokedCapability(_)
                | Self::UnknownCapability(_)
                | Self::InvalidSignature { .. }
        )
    }

    /// Only backpressure is worth retrying by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::MailboxFull { .. })
    }

    /// Admission-time errors are fatal to one attempt only.
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature { .. }
                | Self::UnresolvedDependency { .. }
                | Self::DependencyCycle { .. }
                | Self::InvalidManifest { .. }
                | Self::AlreadyAdmitted { .. }
                | Self::UnsupportedRuntime(_)
                | Self::Denied { .. }
        )
    }
}
