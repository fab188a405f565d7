//! [`Kernel`] – the facade that wires every component together.
//!
//! ```text
//!            ┌──────────────┐  admit   ┌────────────────┐
//!  bundles ─▶│ ModuleRegistry│────────▶│ CapabilityEngine│◀─┐
//!            └──────┬───────┘          └───────┬────────┘  │ authorize
//!                   │ register                 │ audit     │
//!                   ▼                          ▼           │
//!            ┌──────────────┐  wake    ┌──────────────┐  ┌─┴──────┐
//!  step() ──▶│  Scheduler   │◀─────────│   AuditLog   │◀─│ Router │◀── SliceContext
//!            └──────────────┘          └──────────────┘  └────────┘
//! ```
//!
//! Lock order, outermost first: router state, scheduler, capability table,
//! audit chain.  The kernel never holds the scheduler while calling the
//! router, and never holds the registry while opening or closing mailboxes.
//!
//! A module is torn down in one fixed sequence: its undelivered outbound
//! messages are purged, its mailbox is closed, every capability it owns is
//! revoked with cascade, it leaves the live registry, and `ModuleTerminated`
//! is appended.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use esta_ipc::{EndpointInfo, Router, SendReceipt};
use esta_kernel::audit::AuditStats;
use esta_kernel::capability::CapabilityStats;
use esta_kernel::scheduler::DEFAULT_TERMINATED_RETENTION;
use esta_kernel::{
    AdmissionRequest, AdmittedModule, AuditEvent, AuditLog, AuthorityTable, Capability,
    CapabilityEngine, ChainVerification, Clock, Dispatch, FairnessBudget, FairnessFloors,
    ModuleRegistry, ProcessRecord, Scheduler, SignatureVerifier, SliceOutcome, SliceVerdict,
    SystemClock, TerminationReason,
};
use esta_types::{
    BackpressurePolicy, CapabilityId, CapabilityRequest, EstaError, Message, MessageFlags,
    MessageKind, ModuleId, Priority, ProcessId, ResourceKind, ResourceRef, Rights,
};
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::builtin::register_builtins;
use crate::drivers::{Driver, serve_pending, spawn_driver};
use crate::sandbox::{ModuleFactory, ModuleInstance, Runtimes, SliceContext, SliceReport};
use crate::supervisor::{RestartPolicy, Supervisor, SupervisorDecision};

const AUDIT_SOURCE: &str = "kernel";

/// Mailbox name of the kernel itself; replies to kernel-sent requests land
/// here.
pub const KERNEL_MAILBOX: &str = "kernel";

// ────────────────────────────────────────────────────────────────────────────
// Configuration and reports
// ────────────────────────────────────────────────────────────────────────────

/// Everything needed to boot a kernel.  No file I/O happens here.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Verifies module signatures against the operator's trusted key.
    pub verifier: SignatureVerifier,
    /// Capability classes each module may request.
    pub authority: AuthorityTable,
    /// Scheduling and delivery attempts per fairness epoch.
    pub epoch_length: u32,
    pub floors: FairnessFloors,
    /// Depth of mailboxes that have no manifest (kernel, drivers).
    pub default_mailbox_depth: usize,
    /// Applied to modules without a policy of their own.
    pub restart_policy: RestartPolicy,
    /// Terminated process records kept for `processes()` before the oldest
    /// is dropped.
    pub terminated_retention: usize,
}

impl KernelConfig {
    pub fn new(verifier: SignatureVerifier) -> Self {
        Self {
            verifier,
            authority: AuthorityTable::new(),
            epoch_length: esta_kernel::fairness::DEFAULT_EPOCH_LENGTH,
            floors: FairnessFloors::default(),
            default_mailbox_depth: 256,
            restart_policy: RestartPolicy::default(),
            terminated_retention: DEFAULT_TERMINATED_RETENTION,
        }
    }
}

/// One executed slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub pid: ProcessId,
    pub class: Priority,
    /// Metered time, clamped to the slice.
    pub used_ms: u64,
    pub verdict: SliceVerdict,
}

/// Summary of one [`Kernel::run_epoch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EpochReport {
    pub epoch: u64,
    pub slices: u32,
    pub cpu_ms: u64,
    /// Slices per class, indexed by [`Priority::index`].
    pub per_class: [u32; 4],
    pub restarted: Vec<String>,
    pub terminated: Vec<(ProcessId, String)>,
    pub driver_requests: usize,
}

impl EpochReport {
    fn record(&mut self, step: &StepReport) {
        self.slices += 1;
        self.cpu_ms += step.used_ms;
        self.per_class[step.class.index()] += 1;
        if let SliceVerdict::Terminated(reason) = &step.verdict {
            self.terminated.push((step.pid, reason.to_string()));
        }
    }
}

/// Operator snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub version: &'static str,
    pub epoch: u64,
    pub modules: usize,
    pub runnable: usize,
    pub drivers: usize,
    pub pending_restarts: usize,
    pub capabilities: CapabilityStats,
    pub audit: AuditStats,
    pub runtimes: Vec<String>,
}

#[derive(Debug, Clone)]
struct PendingRestart {
    module: ModuleId,
    due_ms: u64,
    attempt: u32,
}

// ────────────────────────────────────────────────────────────────────────────
// Kernel
// ────────────────────────────────────────────────────────────────────────────

type InstanceSlot = Option<Box<dyn ModuleInstance>>;

pub struct Kernel {
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    engine: Arc<CapabilityEngine>,
    scheduler: Arc<Mutex<Scheduler>>,
    router: Arc<Router>,
    registry: Mutex<ModuleRegistry>,
    runtimes: Runtimes,
    /// `None` while the instance is out running a slice.
    instances: Mutex<HashMap<ProcessId, InstanceSlot>>,
    drivers: Mutex<HashMap<ProcessId, Arc<dyn Driver>>>,
    bundles: Mutex<HashMap<ModuleId, AdmissionRequest>>,
    supervisor: Mutex<Supervisor>,
    restarts: Mutex<Vec<PendingRestart>>,
    epoch: AtomicU64,
    epoch_length: u32,
    default_mailbox_depth: usize,
    shutting_down: AtomicBool,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Kernel {
    /// Boot with the wall clock.
    pub fn boot(config: KernelConfig) -> Result<Self, EstaError> {
        Self::boot_with_clock(config, Arc::new(SystemClock))
    }

    /// Boot on an explicit clock.
    ///
    /// Appends `KernelStarted`, opens the kernel mailbox and grants the
    /// kernel `messaging:send:*` so its own messages pass the router check.
    pub fn boot_with_clock(config: KernelConfig, clock: Arc<dyn Clock>) -> Result<Self, EstaError> {
        let audit = Arc::new(AuditLog::new(clock.clone()));
        let engine = Arc::new(CapabilityEngine::new(audit.clone(), clock.clone()));
        let scheduler = Arc::new(Mutex::new(
            Scheduler::new(FairnessBudget::new(config.epoch_length, config.floors))
                .with_retention(config.terminated_retention),
        ));
        let router = Arc::new(Router::new(
            engine.clone(),
            audit.clone(),
            scheduler.clone(),
            clock.clone(),
            config.epoch_length,
            config.floors,
        ));

        let runtimes = Runtimes::new();
        register_builtins(&runtimes);
        let supported = runtimes.clone();
        let registry = ModuleRegistry::new(
            config.verifier,
            config.authority,
            engine.clone(),
            scheduler.clone(),
            audit.clone(),
        )
        .with_runtime_check(move |runtime| supported.supports(runtime));

        audit.append(
            AuditEvent::KernelStarted {
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            AUDIT_SOURCE,
        )?;
        router.open_mailbox(
            ProcessId::KERNEL,
            KERNEL_MAILBOX,
            config.default_mailbox_depth,
            BackpressurePolicy::DropOldest,
        )?;
        engine.request(ResourceRef::any(ResourceKind::Channel), Rights::SEND, ProcessId::KERNEL)?;

        info!(
            epoch_length = config.epoch_length,
            floors = ?config.floors,
            "[esta] kernel booted"
        );
        Ok(Self {
            clock,
            audit,
            engine,
            scheduler,
            router,
            registry: Mutex::new(registry),
            runtimes,
            instances: Mutex::new(HashMap::new()),
            drivers: Mutex::new(HashMap::new()),
            bundles: Mutex::new(HashMap::new()),
            supervisor: Mutex::new(Supervisor::new(config.restart_policy)),
            restarts: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
            epoch_length: config.epoch_length.max(1),
            default_mailbox_depth: config.default_mailbox_depth,
            shutting_down: AtomicBool::new(false),
        })
    }

    fn sched(&self) -> MutexGuard<'_, Scheduler> {
        locked(&self.scheduler)
    }

    fn registry(&self) -> MutexGuard<'_, ModuleRegistry> {
        locked(&self.registry)
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<ProcessId, InstanceSlot>> {
        locked(&self.instances)
    }

    // ── runtimes ───────────────────────────────────────────────────────────

    /// Make `runtime` admissible, backed by `factory`.
    pub fn register_runtime(&self, runtime: &str, factory: Arc<dyn ModuleFactory>) {
        self.runtimes.register(runtime, factory);
    }

    pub fn set_restart_policy(&self, module: ModuleId, policy: RestartPolicy) {
        locked(&self.supervisor).set_policy(module, policy);
    }

    /// Grant `module` an additional capability class before admission.
    pub fn allow(&self, module: &str, capability: &str) -> Result<(), EstaError> {
        self.registry().authority_mut().allow_str(module, capability)
    }

    // ── admission ──────────────────────────────────────────────────────────

    pub fn admit(&self, request: AdmissionRequest) -> Result<ProcessId, EstaError> {
        let mut pids = self.admit_batch(vec![request])?;
        pids.pop().ok_or_else(|| EstaError::InvalidManifest {
            module: String::new(),
            reason: "empty admission".into(),
        })
    }

    /// Admit interdependent modules, all or nothing, and bring them up in
    /// dependency order.
    pub fn admit_batch(&self, requests: Vec<AdmissionRequest>) -> Result<Vec<ProcessId>, EstaError> {
        let admitted = self.registry().admit_batch(requests.clone())?;
        {
            let mut instances = self.instances();
            for module in &admitted {
                instances.insert(module.pid, None);
            }
        }

        if let Err(err) = self.bring_up(&admitted) {
            warn!(%err, "module start failed, rolling back batch");
            for module in &admitted {
                let reason = TerminationReason::Trapped(format!("start failed: {err}"));
                if let Err(term_err) = self.sched().terminate(module.pid, reason.clone()) {
                    warn!(pid = %module.pid, err = %term_err, "rollback terminate failed");
                }
                self.teardown(module.pid, &reason, false)?;
            }
            return Err(err);
        }

        let mut bundles = locked(&self.bundles);
        for req in requests {
            bundles.insert(req.manifest.id(), req);
        }
        drop(bundles);

        let mut pids = Vec::with_capacity(admitted.len());
        for module in &admitted {
            if module.manifest.starts_runnable() {
                self.sched().activate(module.pid)?;
            }
            info!(module = %module.id, pid = %module.pid, runtime = %module.manifest.runtime, "[esta] module started");
            pids.push(module.pid);
        }
        Ok(pids)
    }

    fn bring_up(&self, admitted: &[AdmittedModule]) -> Result<(), EstaError> {
        for module in admitted {
            let instance = self.runtimes.instantiate(module)?;
            let limits = &module.manifest.resource_limits;
            self.router.open_mailbox(
                module.pid,
                &module.manifest.name,
                limits.max_queue_depth,
                module.manifest.backpressure,
            )?;
            self.router.set_request_limit(
                module.pid,
                usize::try_from(limits.max_concurrent_requests).unwrap_or(usize::MAX),
            )?;
            if let Some(slot) = self.instances().get_mut(&module.pid) {
                *slot = Some(instance);
            }
        }
        Ok(())
    }

    // ── messaging ──────────────────────────────────────────────────────────

    /// Route `msg` on behalf of its stated source.
    pub fn send(&self, msg: Message) -> Result<SendReceipt, EstaError> {
        self.router.send(msg)
    }

    /// Send a typed message from the kernel.
    pub fn post(
        &self,
        target: ProcessId,
        priority: Priority,
        kind: MessageKind,
        body: &[u8],
    ) -> Result<SendReceipt, EstaError> {
        let msg = Message::typed(ProcessId::KERNEL, target, priority, kind, body)
            .with_flags(MessageFlags::SYSTEM);
        self.router.send(msg)
    }

    /// Next message addressed to the kernel.
    pub fn receive(&self) -> Result<Option<Message>, EstaError> {
        self.router.receive(ProcessId::KERNEL)
    }

    /// Resolve a mailbox name to its pid.
    pub fn lookup(&self, name: &str) -> Option<ProcessId> {
        self.router.lookup(name)
    }

    // ── execution ──────────────────────────────────────────────────────────

    /// Run one slice of the next runnable module on the calling thread.
    pub fn step(&self) -> Result<Option<StepReport>, EstaError> {
        let Some(dispatch) = self.sched().next() else {
            return Ok(None);
        };
        let report = self.run_dispatched(&dispatch);
        self.finish(dispatch, report).map(Some)
    }

    /// Like [`step`](Self::step), with the slice on tokio's blocking pool.
    pub async fn step_async(self: &Arc<Self>) -> Result<Option<StepReport>, EstaError> {
        let Some(dispatch) = self.sched().next() else {
            return Ok(None);
        };
        let kernel = Arc::clone(self);
        let report = tokio::task::spawn_blocking(move || kernel.run_dispatched(&dispatch))
            .await
            .unwrap_or_else(|err| SliceReport::new(0, SliceOutcome::Trapped(err.to_string())));
        self.finish(dispatch, report).map(Some)
    }

    /// Take the instance out of its slot, run it, and put it back.  A panic
    /// inside the module is a trap; the instance is lost with it.
    fn run_dispatched(&self, dispatch: &Dispatch) -> SliceReport {
        let taken = self.instances().get_mut(&dispatch.pid).and_then(Option::take);
        let Some(mut instance) = taken else {
            return SliceReport::new(0, SliceOutcome::Trapped("no instance".into()));
        };
        let memory_limit = self
            .sched()
            .record(dispatch.pid)
            .map_or(u64::MAX, |r| r.limits.max_memory);
        let mut ctx = SliceContext::new(
            dispatch.pid,
            dispatch.slice,
            self.router.clone(),
            self.clock.clone(),
        )
        .with_memory_limit(memory_limit);
        let ran = catch_unwind(AssertUnwindSafe(|| instance.run_slice(&mut ctx)));
        match ran {
            Ok(report) => {
                // A module torn down mid-slice has no slot left.
                if let Some(slot) = self.instances().get_mut(&dispatch.pid) {
                    *slot = Some(instance);
                }
                report
            }
            Err(_) => SliceReport::new(
                ctx.slice_ms(),
                SliceOutcome::Trapped("module panicked".into()),
            ),
        }
    }

    fn finish(&self, dispatch: Dispatch, report: SliceReport) -> Result<StepReport, EstaError> {
        let slice_ms = u64::try_from(dispatch.slice.as_millis()).unwrap_or(u64::MAX);
        let used_ms = report.used_ms.min(slice_ms);
        let verdict = self.sched().complete(dispatch.pid, used_ms, report.outcome)?;
        debug!(pid = %dispatch.pid, class = ?dispatch.class, used_ms, ?verdict, "slice finished");
        if let SliceVerdict::Terminated(reason) = &verdict {
            self.teardown(dispatch.pid, reason, true)?;
        }
        Ok(StepReport {
            pid: dispatch.pid,
            class: dispatch.class,
            used_ms,
            verdict,
        })
    }

    /// Restart due modules, replenish quotas and bump the epoch counter.
    fn begin_epoch(&self) -> Result<EpochReport, EstaError> {
        let restarted = self.process_restarts()?;
        let woken = self.sched().start_epoch();
        self.router.start_epoch();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, woken = woken.len(), "epoch started");
        Ok(EpochReport {
            epoch,
            restarted,
            ..EpochReport::default()
        })
    }

    /// Run one epoch on the calling thread: at most `epoch_length` slices,
    /// stopping early when nothing is runnable.
    ///
    /// Drivers are not served here; use [`run_epoch_async`](Self::run_epoch_async)
    /// or [`spawn_drivers`](Self::spawn_drivers).
    pub fn run_epoch(&self) -> Result<EpochReport, EstaError> {
        let mut report = self.begin_epoch()?;
        for _ in 0..self.epoch_length {
            match self.step()? {
                Some(step) => report.record(&step),
                None => break,
            }
        }
        info!(epoch = report.epoch, slices = report.slices, cpu_ms = report.cpu_ms, "[esta] epoch complete");
        Ok(report)
    }

    /// Run one epoch with up to `workers` slices in flight on tokio's
    /// blocking pool, serving drivers between waves.
    pub async fn run_epoch_async(self: &Arc<Self>, workers: usize) -> Result<EpochReport, EstaError> {
        let mut report = self.begin_epoch()?;
        let workers = workers.max(1);
        let mut remaining = self.epoch_length;
        let mut running = JoinSet::new();

        loop {
            report.driver_requests += self.serve_drivers().await?;
            while running.len() < workers && remaining > 0 {
                let Some(dispatch) = self.sched().next() else {
                    break;
                };
                remaining -= 1;
                let kernel = Arc::clone(self);
                running.spawn_blocking(move || {
                    let slice = kernel.run_dispatched(&dispatch);
                    (dispatch, slice)
                });
            }
            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok((dispatch, slice)) => {
                    let step = self.finish(dispatch, slice)?;
                    report.record(&step);
                }
                Err(err) => warn!(%err, "slice task lost"),
            }
        }
        info!(
            epoch = report.epoch,
            slices = report.slices,
            cpu_ms = report.cpu_ms,
            workers,
            "[esta] epoch complete"
        );
        Ok(report)
    }

    // ── drivers ────────────────────────────────────────────────────────────

    /// Host `driver` as a pseudo-process reachable at `channel:<name>`.
    ///
    /// Drivers may reply to any endpoint; callers still need a capability
    /// for the driver's channel to reach it.
    pub fn attach_driver(&self, driver: Arc<dyn Driver>) -> Result<ProcessId, EstaError> {
        let pid = self.registry().allocate_pid();
        self.router.open_mailbox(
            pid,
            driver.name(),
            self.default_mailbox_depth,
            BackpressurePolicy::NotifySender,
        )?;
        let reply = CapabilityRequest::new(ResourceRef::any(ResourceKind::Channel), Rights::SEND);
        self.engine.bind_authority(pid, vec![reply.clone()]);
        self.engine.request(reply.resource, reply.rights, pid)?;
        info!(driver = driver.name(), %pid, "[esta] driver attached");
        locked(&self.drivers).insert(pid, driver);
        Ok(pid)
    }

    /// Answer every queued driver request once.
    pub async fn serve_drivers(&self) -> Result<usize, EstaError> {
        let drivers: Vec<(ProcessId, Arc<dyn Driver>)> = locked(&self.drivers)
            .iter()
            .map(|(pid, d)| (*pid, Arc::clone(d)))
            .collect();
        let mut served = 0;
        for (pid, driver) in drivers {
            served += serve_pending(&self.router, pid, driver.as_ref()).await?;
        }
        Ok(served)
    }

    /// Serve every driver on its own task until its mailbox closes.
    pub fn spawn_drivers(&self) -> Vec<JoinHandle<()>> {
        locked(&self.drivers)
            .iter()
            .map(|(pid, d)| spawn_driver(self.router.clone(), *pid, Arc::clone(d)))
            .collect()
    }

    // ── capabilities ───────────────────────────────────────────────────────

    /// Mint a capability for a running module within its authority.
    pub fn request_capability(
        &self,
        pid: ProcessId,
        request: CapabilityRequest,
    ) -> Result<Capability, EstaError> {
        let cap = self.engine.request(request.resource, request.rights, pid)?;
        self.attach(pid, cap.id);
        Ok(cap)
    }

    /// Delegate `cap` from its holder to `target` with `rights`.
    pub fn delegate(
        &self,
        holder: ProcessId,
        cap: CapabilityId,
        target: ProcessId,
        rights: Rights,
    ) -> Result<Capability, EstaError> {
        let owner = self.engine.get(cap).map(|c| c.owner);
        if owner.is_some_and(|o| o != holder) {
            let reason = format!("{holder} does not hold {cap}");
            warn!(%holder, %cap, "delegation by non-holder refused");
            self.audit.append(
                AuditEvent::CapabilityDenied {
                    requester: holder,
                    resource: cap.to_string(),
                    reason: reason.clone(),
                },
                AUDIT_SOURCE,
            )?;
            return Err(EstaError::Unauthorized { reason });
        }
        let child = self.engine.delegate(cap, target, rights)?;
        self.attach(target, child.id);
        Ok(child)
    }

    /// Record `cap` on the holder's process record.  The engine stays the
    /// owner, so a holder without a record (kernel, drivers) only loses the
    /// back-reference.
    fn attach(&self, pid: ProcessId, cap: CapabilityId) {
        if let Err(err) = self.sched().attach_capabilities(pid, [cap]) {
            warn!(%pid, %cap, %err, "capability not attached to a process record");
        }
    }

    /// Revoke `cap` and everything derived from it.
    pub fn revoke(&self, cap: CapabilityId) -> Result<usize, EstaError> {
        self.engine.revoke(cap)
    }

    // ── termination ────────────────────────────────────────────────────────

    /// Operator termination.  Returns `false` when `pid` was already down.
    pub fn terminate(&self, pid: ProcessId) -> Result<bool, EstaError> {
        let reason = TerminationReason::Revoked;
        if !self.sched().terminate(pid, reason.clone())? {
            return Ok(false);
        }
        self.teardown(pid, &reason, true)?;
        Ok(true)
    }

    /// Undo everything a live module holds.  Runs at most once per pid.
    fn teardown(&self, pid: ProcessId, reason: &TerminationReason, supervise: bool) -> Result<(), EstaError> {
        if self.instances().remove(&pid).is_none() {
            return Ok(());
        }
        let purged = self.router.purge_from(pid)?;
        if self.router.is_open(pid) {
            self.router.close_mailbox(pid)?;
        }
        let revoked = self.engine.revoke_owner(pid)?;
        let module = self.registry().retire(pid);
        self.audit.append(
            AuditEvent::ModuleTerminated {
                pid,
                reason: reason.to_string(),
            },
            AUDIT_SOURCE,
        )?;
        info!(%pid, %reason, purged, revoked, "[esta] module torn down");

        if supervise
            && !self.shutting_down.load(Ordering::SeqCst)
            && let Some(module) = module
        {
            self.supervise(module.id, reason);
        }
        Ok(())
    }

    fn supervise(&self, module: ModuleId, reason: &TerminationReason) {
        let now = self.clock.now_ms();
        let decision = locked(&self.supervisor).on_termination(&module, reason, now);
        if let SupervisorDecision::Restart { after_ms, attempt } = decision {
            locked(&self.restarts).push(PendingRestart {
                module,
                due_ms: now.saturating_add(after_ms),
                attempt,
            });
        }
    }

    /// Re-admit every module whose backoff has elapsed.
    pub fn process_restarts(&self) -> Result<Vec<String>, EstaError> {
        let now = self.clock.now_ms();
        let due: Vec<PendingRestart> = {
            let mut restarts = locked(&self.restarts);
            let (due, later) = restarts.drain(..).partition(|r| r.due_ms <= now);
            *restarts = later;
            due
        };

        let mut restarted = Vec::new();
        for pending in due {
            let bundle = locked(&self.bundles).get(&pending.module).cloned();
            let Some(bundle) = bundle else {
                warn!(module = %pending.module, "no stored bundle, restart skipped");
                continue;
            };
            match self.admit(bundle) {
                Ok(pid) => {
                    self.audit.append(
                        AuditEvent::ModuleRestarted {
                            module: pending.module.to_string(),
                            attempt: pending.attempt,
                        },
                        AUDIT_SOURCE,
                    )?;
                    info!(module = %pending.module, %pid, attempt = pending.attempt, "[esta] module restarted");
                    restarted.push(pending.module.to_string());
                }
                Err(err) => warn!(module = %pending.module, %err, "restart admission failed"),
            }
        }
        Ok(restarted)
    }

    /// Deliver `SystemShutdown` to every live module, give each a last
    /// chance to run, then terminate whatever is left.
    pub fn shutdown(&self, reason: &str) -> Result<(), EstaError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let live: Vec<ProcessId> = self
            .sched()
            .processes()
            .filter(|r| !r.state.is_terminated())
            .map(|r| r.pid)
            .collect();

        for &pid in &live {
            if let Err(err) = self.post(pid, Priority::Critical, MessageKind::SystemShutdown, &[]) {
                debug!(%pid, %err, "shutdown notice not delivered");
            }
        }
        for _ in 0..live.len() * 2 {
            if self.step()?.is_none() {
                break;
            }
        }
        for &pid in &live {
            if self.sched().terminate(pid, TerminationReason::Shutdown)? {
                self.teardown(pid, &TerminationReason::Shutdown, false)?;
            }
        }

        let drivers: Vec<ProcessId> = locked(&self.drivers).drain().map(|(pid, _)| pid).collect();
        for pid in drivers {
            self.router.close_mailbox(pid)?;
            self.engine.revoke_owner(pid)?;
            self.engine.unbind_authority(pid);
        }

        self.audit.append(
            AuditEvent::KernelShutdown {
                reason: reason.to_string(),
            },
            AUDIT_SOURCE,
        )?;
        info!(reason, "[esta] kernel shut down");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ── queries ────────────────────────────────────────────────────────────

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn engine(&self) -> &Arc<CapabilityEngine> {
        &self.engine
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn verify_audit(&self) -> ChainVerification {
        self.audit.verify_report(..)
    }

    pub fn process(&self, pid: ProcessId) -> Option<ProcessRecord> {
        self.sched().record(pid).cloned()
    }

    pub fn processes(&self) -> Vec<ProcessRecord> {
        self.sched().processes().cloned().collect()
    }

    pub fn module(&self, pid: ProcessId) -> Option<AdmittedModule> {
        self.registry().by_pid(pid).cloned()
    }

    pub fn modules(&self) -> Vec<AdmittedModule> {
        self.registry().modules().cloned().collect()
    }

    pub fn capabilities_of(&self, pid: ProcessId) -> Vec<Capability> {
        self.engine.capabilities_of(pid)
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.router.endpoints()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> KernelStatus {
        let (modules, runnable) = {
            let sched = self.sched();
            let live = sched.processes().filter(|r| !r.state.is_terminated()).count();
            (live, sched.runnable_count())
        };
        KernelStatus {
            version: env!("CARGO_PKG_VERSION"),
            epoch: self.epoch(),
            modules,
            runnable,
            drivers: locked(&self.drivers).len(),
            pending_restarts: locked(&self.restarts).len(),
            capabilities: self.engine.stats(),
            audit: self.audit.stats(),
            runtimes: self.runtimes.names(),
        }
    }
}
