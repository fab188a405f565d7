//! `esta-kernel` – Authority & Scheduling
//!
//! The trusted core of ESTA.  Nothing in here runs module code; it decides
//! who may do what, and when.
//!
//! # Modules
//!
//! - [`capability`] – [`CapabilityEngine`][capability::CapabilityEngine]:
//!   issues, validates, delegates (with strict attenuation) and revokes
//!   capabilities.  The only authority in the system.
//! - [`authority`] – [`AuthorityTable`][authority::AuthorityTable]: the
//!   operator-configured list of capability classes each module may request.
//! - [`audit`] – [`AuditLog`][audit::AuditLog]: append-only, SHA-256
//!   hash-chained record of every security-relevant operation.
//! - [`scheduler`] – [`Scheduler`][scheduler::Scheduler]: owns every
//!   process state and hands out bounded time slices by priority class.
//! - [`fairness`] – [`FairnessBudget`][fairness::FairnessBudget]: the
//!   per-epoch anti-starvation floors shared by scheduling and delivery.
//! - [`registry`] – [`ModuleRegistry`][registry::ModuleRegistry]: the loader;
//!   signature check, manifest validation, dependency ordering and atomic
//!   capability grant.
//! - [`signature`] – Ed25519 module signatures over
//!   `hex(SHA-256(bytes)) ‖ bytes`.
//! - [`clock`] – the [`Clock`][clock::Clock] seam used for timestamps and
//!   validity windows.

pub mod audit;
pub mod authority;
pub mod capability;
pub mod clock;
pub mod fairness;
pub mod registry;
pub mod scheduler;
pub mod signature;

pub use audit::{AuditEntry, AuditEvent, AuditLog, ChainVerification};
pub use authority::AuthorityTable;
pub use capability::{Capability, CapabilityEngine, Validity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use fairness::{FairnessBudget, FairnessFloors};
pub use registry::{AdmissionRequest, AdmittedModule, ModuleRegistry};
pub use scheduler::{
    Dispatch, ProcessRecord, ProcessState, Scheduler, SliceOutcome, SliceVerdict,
    TerminationReason, WaitReason, WakeEvent,
};
pub use signature::{ModuleSigner, SignatureVerifier};
