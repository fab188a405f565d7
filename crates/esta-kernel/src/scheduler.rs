//! [`Scheduler`] – decides when each admitted module runs.
//!
//! Process states and the only legal transitions:
//!
//! ```text
//! Admitted ──activate / first message──▶ Runnable ──next()──▶ Running
//!                                           ▲                    │
//!                                           │ wake               ├─▶ Runnable   (slice expired, yield)
//!                                           │                    ├─▶ Blocked    (wait, quota, backpressure)
//!                                        Blocked ◀───────────────┘
//!                                                                └─▶ Terminated (quota, exit, trap)
//! ```
//!
//! Every state is owned here.  Other components ask for transitions
//! ([`block`](Scheduler::block), [`wake`](Scheduler::wake),
//! [`terminate`](Scheduler::terminate)); modules never touch their record.
//!
//! Dispatch is strict priority across classes, round-robin within a class,
//! with the same [`FairnessBudget`] floors the router uses for delivery.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use esta_types::{CapabilityId, EstaError, ModuleId, Priority, ProcessId, ResourceLimits};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fairness::FairnessBudget;

// ────────────────────────────────────────────────────────────────────────────
// States
// ────────────────────────────────────────────────────────────────────────────

/// Why a process is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitReason {
    /// Waiting for a message in its own mailbox.
    Message,
    /// Sender parked by a `BlockSender` mailbox of the given target.
    MailboxSpace(ProcessId),
    /// Per-epoch CPU quota used up.
    QuotaReplenish,
    /// Yielded to await a collaborator driver reply.
    Driver,
}

/// Why a process was terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    QuotaExceeded,
    Exited,
    Trapped(String),
    /// Admission revoked by the kernel or an operator.
    Revoked,
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExceeded => f.write_str("QuotaExceeded"),
            Self::Exited => f.write_str("Exited"),
            Self::Trapped(why) => write!(f, "Trapped({why})"),
            Self::Revoked => f.write_str("Revoked"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Admitted,
    Runnable,
    Running,
    Blocked(WaitReason),
    Terminated(TerminationReason),
}

impl ProcessState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Admitted => "Admitted",
            Self::Runnable => "Runnable",
            Self::Running => "Running",
            Self::Blocked(_) => "Blocked",
            Self::Terminated(_) => "Terminated",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

/// Terminated records kept for inspection before the oldest is forgotten.
pub const DEFAULT_TERMINATED_RETENTION: usize = 64;

/// Events that can move a blocked process back to `Runnable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeEvent {
    /// A message landed in the process's mailbox.
    MessageArrived,
    /// A mailbox the process was parked on has room again.
    SpaceFreed,
    /// A new epoch replenished the CPU quota.
    QuotaReplenished,
}

/// Scheduler-owned bookkeeping for one process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub pid: ProcessId,
    pub module: ModuleId,
    pub priority: Priority,
    pub state: ProcessState,
    /// Back-references only; the capability engine owns the objects.
    pub capabilities: Vec<CapabilityId>,
    pub limits: ResourceLimits,
    pub runtime_used_ms: u64,
    pub epoch_used_ms: u64,
    pub slices: u64,
    #[serde(skip)]
    current_slice_ms: u64,
    #[serde(skip)]
    pending_block: Option<WaitReason>,
    #[serde(skip)]
    woken_while_running: bool,
}

impl ProcessRecord {
    /// Cumulative execution time left before `QuotaExceeded`.
    pub fn quota_remaining_ms(&self) -> u64 {
        self.limits
            .max_execution_time_ms
            .saturating_sub(self.runtime_used_ms)
    }

    fn epoch_remaining_ms(&self) -> u64 {
        self.limits
            .cpu_quota_ms
            .map_or(u64::MAX, |q| q.saturating_sub(self.epoch_used_ms))
    }
}

/// A slice handed to a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub pid: ProcessId,
    pub class: Priority,
    /// Class quantum clamped to the remaining quotas.
    pub slice: Duration,
}

/// How a module's slice ended, as reported by its runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceOutcome {
    /// Gave up the CPU voluntarily with work left.
    Yielded,
    /// Interrupted at slice expiry.
    Preempted,
    /// Mailbox drained; wait for the next message.
    WaitMessage,
    /// Awaiting a driver reply.
    AwaitDriver,
    Exited,
    Trapped(String),
}

/// Where the process ended up after [`Scheduler::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceVerdict {
    Requeued,
    Blocked(WaitReason),
    Terminated(TerminationReason),
}

// ────────────────────────────────────────────────────────────────────────────
// Scheduler
// ────────────────────────────────────────────────────────────────────────────

/// Priority scheduler with per-class round-robin queues.
///
/// # Example
///
/// ```
/// use esta_kernel::scheduler::{Scheduler, SliceOutcome, SliceVerdict};
/// use esta_types::{Priority, ProcessId, ResourceLimits};
///
/// let mut sched = Scheduler::default();
/// let pid = ProcessId(1);
/// sched.register(pid, "echo".into(), Priority::Normal, ResourceLimits::default()).unwrap();
/// sched.activate(pid).unwrap();
///
/// let d = sched.next().unwrap();
/// assert_eq!(d.slice.as_millis(), 25);
/// let verdict = sched.complete(pid, 25, SliceOutcome::Preempted).unwrap();
/// assert_eq!(verdict, SliceVerdict::Requeued);
/// ```
#[derive(Debug)]
pub struct Scheduler {
    processes: BTreeMap<ProcessId, ProcessRecord>,
    queues: [VecDeque<ProcessId>; 4],
    budget: FairnessBudget,
    /// Terminated pids, oldest first.
    terminated: VecDeque<ProcessId>,
    retention: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(FairnessBudget::default())
    }
}

impl Scheduler {
    pub fn new(budget: FairnessBudget) -> Self {
        Self {
            processes: BTreeMap::new(),
            queues: Default::default(),
            budget,
            terminated: VecDeque::new(),
            retention: DEFAULT_TERMINATED_RETENTION,
        }
    }

    /// Keep at most `retention` terminated records.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    fn record_mut(&mut self, pid: ProcessId) -> Result<&mut ProcessRecord, EstaError> {
        self.processes
            .get_mut(&pid)
            .ok_or(EstaError::UnknownProcess(pid))
    }

    fn illegal(pid: ProcessId, from: &ProcessState, to: &str) -> EstaError {
        EstaError::InvalidTransition {
            pid,
            from: from.name().to_string(),
            to: to.to_string(),
        }
    }

    fn enqueue(&mut self, pid: ProcessId, class: Priority) {
        self.queues[class.index()].push_back(pid);
    }

    fn dequeue(&mut self, pid: ProcessId, class: Priority) {
        self.queues[class.index()].retain(|&p| p != pid);
    }

    /// Remember a fresh termination and forget the oldest records beyond
    /// the retention bound.
    fn note_terminated(&mut self, pid: ProcessId) {
        self.terminated.push_back(pid);
        while self.terminated.len() > self.retention {
            let Some(oldest) = self.terminated.pop_front() else {
                break;
            };
            if self.forget(oldest).is_some() {
                debug!(pid = %oldest, "terminated record forgotten");
            }
        }
    }

    // ── registration ───────────────────────────────────────────────────────

    /// Register an admitted module.  It stays `Admitted` until activated.
    pub fn register(
        &mut self,
        pid: ProcessId,
        module: ModuleId,
        priority: Priority,
        limits: ResourceLimits,
    ) -> Result<(), EstaError> {
        if self.processes.contains_key(&pid) {
            return Err(EstaError::AlreadyAdmitted {
                module: module.to_string(),
            });
        }
        debug!(%pid, %module, ?priority, "process registered");
        self.processes.insert(
            pid,
            ProcessRecord {
                pid,
                module,
                priority,
                state: ProcessState::Admitted,
                capabilities: Vec::new(),
                limits,
                runtime_used_ms: 0,
                epoch_used_ms: 0,
                slices: 0,
                current_slice_ms: 0,
                pending_block: None,
                woken_while_running: false,
            },
        );
        Ok(())
    }

    pub fn attach_capabilities(
        &mut self,
        pid: ProcessId,
        caps: impl IntoIterator<Item = CapabilityId>,
    ) -> Result<(), EstaError> {
        self.record_mut(pid)?.capabilities.extend(caps);
        Ok(())
    }

    /// `Admitted → Runnable`.
    pub fn activate(&mut self, pid: ProcessId) -> Result<(), EstaError> {
        let record = self.record_mut(pid)?;
        if record.state != ProcessState::Admitted {
            return Err(Self::illegal(pid, &record.state, "Runnable"));
        }
        record.state = ProcessState::Runnable;
        let class = record.priority;
        self.enqueue(pid, class);
        Ok(())
    }

    /// Remove a terminated process's record entirely.
    pub fn forget(&mut self, pid: ProcessId) -> Option<ProcessRecord> {
        let record = self.processes.remove(&pid)?;
        self.dequeue(pid, record.priority);
        self.terminated.retain(|&p| p != pid);
        Some(record)
    }

    // ── dispatch ───────────────────────────────────────────────────────────

    /// Pick the next process and mark it `Running`.
    pub fn next(&mut self) -> Option<Dispatch> {
        let ready = [0usize, 1, 2, 3].map(|i| !self.queues[i].is_empty());
        let class = self.budget.select(ready)?;
        let pid = self.queues[class.index()].pop_front()?;
        let record = self.processes.get_mut(&pid)?;

        let slice_ms = u64::try_from(class.time_slice().as_millis())
            .unwrap_or(u64::MAX)
            .min(record.quota_remaining_ms())
            .min(record.epoch_remaining_ms())
            .max(1);
        record.state = ProcessState::Running;
        record.current_slice_ms = slice_ms;
        record.pending_block = None;
        record.woken_while_running = false;
        debug!(%pid, ?class, slice_ms, "dispatch");
        Some(Dispatch {
            pid,
            class,
            slice: Duration::from_millis(slice_ms),
        })
    }

    /// Account a finished slice and move the process to its next state.
    ///
    /// `used_ms` is clamped to the dispatched slice.  A process terminated
    /// while its slice was in flight stays terminated.
    pub fn complete(
        &mut self,
        pid: ProcessId,
        used_ms: u64,
        outcome: SliceOutcome,
    ) -> Result<SliceVerdict, EstaError> {
        let record = self.record_mut(pid)?;
        if let ProcessState::Terminated(reason) = &record.state {
            return Ok(SliceVerdict::Terminated(reason.clone()));
        }
        if record.state != ProcessState::Running {
            return Err(Self::illegal(pid, &record.state, "slice end"));
        }

        let used = used_ms.min(record.current_slice_ms);
        record.runtime_used_ms += used;
        record.epoch_used_ms += used;
        record.slices += 1;

        let verdict = if record.runtime_used_ms >= record.limits.max_execution_time_ms {
            warn!(
                %pid,
                runtime_ms = record.runtime_used_ms,
                limit_ms = record.limits.max_execution_time_ms,
                "execution quota exceeded"
            );
            SliceVerdict::Terminated(TerminationReason::QuotaExceeded)
        } else {
            match outcome {
                SliceOutcome::Exited => SliceVerdict::Terminated(TerminationReason::Exited),
                SliceOutcome::Trapped(why) => {
                    SliceVerdict::Terminated(TerminationReason::Trapped(why))
                }
                _ if record.epoch_remaining_ms() == 0 => {
                    SliceVerdict::Blocked(WaitReason::QuotaReplenish)
                }
                _ if record.pending_block.is_some() => {
                    SliceVerdict::Blocked(record.pending_block.unwrap_or(WaitReason::Message))
                }
                SliceOutcome::WaitMessage if !record.woken_while_running => {
                    SliceVerdict::Blocked(WaitReason::Message)
                }
                SliceOutcome::AwaitDriver if !record.woken_while_running => {
                    SliceVerdict::Blocked(WaitReason::Driver)
                }
                _ => SliceVerdict::Requeued,
            }
        };

        record.pending_block = None;
        record.woken_while_running = false;
        record.current_slice_ms = 0;
        record.state = match &verdict {
            SliceVerdict::Requeued => ProcessState::Runnable,
            SliceVerdict::Blocked(why) => ProcessState::Blocked(*why),
            SliceVerdict::Terminated(reason) => ProcessState::Terminated(reason.clone()),
        };
        let class = record.priority;
        match &verdict {
            SliceVerdict::Requeued => self.enqueue(pid, class),
            SliceVerdict::Terminated(reason) => {
                info!(%pid, %reason, "process terminated");
                self.note_terminated(pid);
            }
            SliceVerdict::Blocked(why) => debug!(%pid, ?why, "process blocked"),
        }
        Ok(verdict)
    }

    // ── transitions requested by other components ──────────────────────────

    /// Block `pid`.  A running process finishes its slice first.
    pub fn block(&mut self, pid: ProcessId, reason: WaitReason) -> Result<(), EstaError> {
        let record = self.record_mut(pid)?;
        match &record.state {
            ProcessState::Running => {
                record.pending_block = Some(reason);
                return Ok(());
            }
            ProcessState::Runnable | ProcessState::Blocked(_) => {}
            other => return Err(Self::illegal(pid, other, "Blocked")),
        }
        record.state = ProcessState::Blocked(reason);
        let class = record.priority;
        self.dequeue(pid, class);
        Ok(())
    }

    /// Deliver a wake event.  Returns `true` when the process became
    /// `Runnable`.
    ///
    /// A message wakes a lazily admitted process for the first time.  A
    /// quota-blocked process only wakes on replenishment.
    pub fn wake(&mut self, pid: ProcessId, event: WakeEvent) -> Result<bool, EstaError> {
        let record = self.record_mut(pid)?;
        let runnable = match (&record.state, event) {
            (ProcessState::Admitted, WakeEvent::MessageArrived) => true,
            (
                ProcessState::Blocked(WaitReason::Message | WaitReason::Driver),
                WakeEvent::MessageArrived,
            ) => true,
            (ProcessState::Blocked(WaitReason::MailboxSpace(_)), WakeEvent::SpaceFreed) => true,
            (ProcessState::Blocked(WaitReason::QuotaReplenish), WakeEvent::QuotaReplenished) => {
                true
            }
            (ProcessState::Running, WakeEvent::MessageArrived) => {
                record.woken_while_running = true;
                false
            }
            (ProcessState::Running, WakeEvent::SpaceFreed) => {
                if matches!(record.pending_block, Some(WaitReason::MailboxSpace(_))) {
                    record.pending_block = None;
                }
                false
            }
            _ => false,
        };
        if runnable {
            record.state = ProcessState::Runnable;
            let class = record.priority;
            self.enqueue(pid, class);
            debug!(%pid, ?event, "process woken");
        }
        Ok(runnable)
    }

    /// Force `pid` into `Terminated`.  Returns `false` when it already was.
    pub fn terminate(
        &mut self,
        pid: ProcessId,
        reason: TerminationReason,
    ) -> Result<bool, EstaError> {
        let record = self.record_mut(pid)?;
        if record.state.is_terminated() {
            return Ok(false);
        }
        info!(%pid, %reason, "process terminated");
        record.state = ProcessState::Terminated(reason);
        let class = record.priority;
        self.dequeue(pid, class);
        self.note_terminated(pid);
        Ok(true)
    }

    /// Replenish per-epoch CPU quotas, waking quota-blocked processes, and
    /// restart the fairness budget.
    pub fn start_epoch(&mut self) -> Vec<ProcessId> {
        self.budget.reset_epoch();
        let mut woken = Vec::new();
        for record in self.processes.values_mut() {
            record.epoch_used_ms = 0;
            if record.state == ProcessState::Blocked(WaitReason::QuotaReplenish) {
                woken.push(record.pid);
            }
        }
        for &pid in &woken {
            if let Err(err) = self.wake(pid, WakeEvent::QuotaReplenished) {
                warn!(%pid, %err, "quota replenishment wake failed");
            }
        }
        woken
    }

    // ── queries ────────────────────────────────────────────────────────────

    pub fn state(&self, pid: ProcessId) -> Option<ProcessState> {
        self.processes.get(&pid).map(|r| r.state.clone())
    }

    pub fn record(&self, pid: ProcessId) -> Option<&ProcessRecord> {
        self.processes.get(&pid)
    }

    pub fn is_alive(&self, pid: ProcessId) -> bool {
        self.processes
            .get(&pid)
            .is_some_and(|r| !r.state.is_terminated())
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.processes.values()
    }

    pub fn runnable_count(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn budget(&self) -> &FairnessBudget {
        &self.budget
    }
}
