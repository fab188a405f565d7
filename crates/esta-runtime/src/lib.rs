//! `esta-runtime` – Host & Orchestration
//!
//! Everything that sits around the trusted core: module instances, drivers,
//! restart supervision, and the [`Kernel`] facade that boots and drives the
//! whole system.
//!
//! # Modules
//!
//! - [`kernel`] – [`Kernel`][kernel::Kernel] and
//!   [`KernelConfig`][kernel::KernelConfig]: boot, admission, slice
//!   execution (inline or on tokio's blocking pool), epochs, capability
//!   delegation, termination and shutdown.
//! - [`sandbox`] – [`ModuleInstance`][sandbox::ModuleInstance] and
//!   [`ModuleFactory`][sandbox::ModuleFactory]: the contract a module runtime
//!   implements.  Instances see the world only through a
//!   [`SliceContext`][sandbox::SliceContext].
//! - [`builtin`] – the `builtin:echo` and `builtin:spin` modules.
//! - [`drivers`] – the async [`Driver`][drivers::Driver] trait and
//!   [`ClockDriver`][drivers::ClockDriver].
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]: restart
//!   strategies, intensity window and exponential backoff.
//! - [`bundle`] – signed module bundles on disk.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the
//!   `tracing` subscriber with optional OTLP export.
//!
//! # Example
//!
//! ```rust
//! use esta_kernel::{AdmissionRequest, ModuleSigner};
//! use esta_runtime::{Kernel, KernelConfig};
//! use esta_types::ModuleManifest;
//!
//! let signer = ModuleSigner::from_seed([1; 32]);
//! let kernel = Kernel::boot(KernelConfig::new(signer.verifier())).unwrap();
//!
//! let bytes = b"echo".to_vec();
//! let pid = kernel
//!     .admit(AdmissionRequest {
//!         manifest: ModuleManifest::new("echo", "1.0.0", "builtin:echo"),
//!         signature: signer.sign_module(&bytes),
//!         module_bytes: bytes,
//!     })
//!     .unwrap();
//!
//! let report = kernel.run_epoch().unwrap();
//! assert_eq!(report.slices, 1);
//! assert!(kernel.process(pid).is_some());
//! ```

pub mod builtin;
pub mod bundle;
pub mod drivers;
pub mod kernel;
pub mod sandbox;
pub mod supervisor;
pub mod telemetry;

pub use drivers::{ClockDriver, Driver};
pub use kernel::{EpochReport, Kernel, KernelConfig, KernelStatus, StepReport};
pub use sandbox::{ModuleFactory, ModuleInstance, Runtimes, SliceContext, SliceReport};
pub use supervisor::{RestartPolicy, RestartStrategy, Supervisor, SupervisorDecision};
pub use telemetry::{TracerProviderGuard, init_tracing};
