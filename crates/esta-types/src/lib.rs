//! `esta-types` – the shared data model of the ESTA microkernel.
//!
//! Every other crate speaks in these types: process and capability
//! identifiers, the [`Rights`] bit set, typed [`ResourceRef`]s, IPC
//! [`Message`]s, [`ModuleManifest`]s and the global [`EstaError`] taxonomy.

pub mod error;
pub mod ids;
pub mod manifest;
pub mod message;
pub mod resource;
pub mod rights;

pub use error::EstaError;
pub use ids::{CapabilityId, MessageId, ModuleId, ProcessId};
pub use manifest::{
    BackpressurePolicy, ModuleManifest, ModulePriority, ResourceLimits, manifest_schema,
};
pub use message::{MAX_PAYLOAD_BYTES, Message, MessageFlags, MessageKind, Priority};
pub use resource::{CapabilityRequest, ResourceKind, ResourceRef};
pub use rights::Rights;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_serialization_roundtrip() {
        let err = EstaError::AttenuationViolation {
            requested: vec!["write".into()],
            held: vec!["read".into()],
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: EstaError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn error_display() {
        let err = EstaError::MailboxFull {
            target: ProcessId(7),
        };
        assert!(err.to_string().contains("pid:7"));

        let err = EstaError::UnresolvedDependency {
            module: "ui".into(),
            dependency: "accrual".into(),
        };
        assert!(err.to_string().contains("accrual"));
    }

    #[test]
    fn propagation_policy() {
        assert!(EstaError::MailboxFull { target: ProcessId(1) }.is_retryable());
        assert!(!EstaError::Unauthorized { reason: "x".into() }.is_retryable());
        assert!(EstaError::Unauthorized { reason: "x".into() }.is_security_violation());
        assert!(!EstaError::QuotaExceeded { pid: ProcessId(1) }.is_security_violation());
        assert!(EstaError::DependencyCycle { modules: vec![] }.is_admission_failure());
    }

    #[test]
    fn capability_ids_are_unique() {
        assert_ne!(CapabilityId::mint(), CapabilityId::mint());
    }

    #[test]
    fn kernel_pid_is_zero() {
        assert!(ProcessId::KERNEL.is_kernel());
        assert!(!ProcessId(3).is_kernel());
        assert_eq!(ProcessId(3).to_string(), "pid:3");
    }
}
