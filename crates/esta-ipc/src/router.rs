//! [`Router`] – capability-checked delivery between process mailboxes.
//!
//! A send runs these checks in order, auditing every rejection as
//! `MessageRejected`:
//!
//! 1. the source is known and not terminated;
//! 2. the target mailbox exists;
//! 3. the source holds a live `SEND` capability on `channel:<target name>`,
//!    re-validated through the [`CapabilityEngine`] on every send;
//! 4. the target is not terminated;
//! 5. the payload fits in 1 MiB;
//! 6. a `REPLY_EXPECTED` send stays within the source's request limit.
//!
//! Accepted messages are stamped with the next sequence number for their
//! `(source, target)` pair and the kernel time, then handed to the target's
//! [`Mailbox`] and its backpressure policy.  Deliveries are audited at
//! receive time.
//!
//! Every accepted `REPLY_EXPECTED` message stays outstanding until the
//! target sends a `REPLY` back to the requester.  When the target's mailbox
//! closes first, each requester still waiting gets a `SYSTEM | REPLY`
//! [`MessageKind::Error`](esta_types::MessageKind::Error) carrying
//! `ModuleTerminated` and is woken.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use esta_kernel::audit::{AuditEvent, AuditLog};
use esta_kernel::capability::CapabilityEngine;
use esta_kernel::clock::Clock;
use esta_kernel::fairness::FairnessFloors;
use esta_kernel::scheduler::{ProcessState, Scheduler, WaitReason, WakeEvent};
use esta_types::{
    BackpressurePolicy, EstaError, MAX_PAYLOAD_BYTES, Message, MessageFlags, MessageId, Priority,
    ProcessId, ResourceRef, Rights,
};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::mailbox::{Mailbox, MailboxState, MailboxStats, PushOutcome};

const AUDIT_SOURCE: &str = "router";

/// What happened to an accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Queued,
    /// Discarded by `DropNewest`, or by `DropOldest` with nothing to evict.
    Dropped,
    /// Queued after evicting the given message.
    Evicted(MessageId),
    /// Waiting for room under `BlockSender`; the sender is blocked.
    Parked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub id: MessageId,
    pub sequence: u64,
    pub disposition: Disposition,
}

/// Operator view of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub pid: ProcessId,
    pub name: String,
    pub open: bool,
    pub state: MailboxState,
    pub len: usize,
    pub stats: MailboxStats,
    /// Delivery-floor epochs the mailbox has been through.
    pub delivery_epoch: u64,
    /// `REPLY_EXPECTED` messages this endpoint is still waiting on.
    pub outstanding: usize,
}

struct Endpoint {
    name: String,
    open: bool,
    mailbox: Mailbox,
    notify: Arc<Notify>,
    /// Cap on outstanding `REPLY_EXPECTED` sends from this endpoint.
    request_limit: Option<usize>,
}

/// A `REPLY_EXPECTED` message that has not been answered yet.
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    id: MessageId,
    requester: ProcessId,
    target: ProcessId,
    priority: Priority,
}

#[derive(Default)]
struct RouterState {
    endpoints: HashMap<ProcessId, Endpoint>,
    sequences: HashMap<(ProcessId, ProcessId), u64>,
    /// Oldest first.
    requests: Vec<PendingRequest>,
}

impl RouterState {
    fn outstanding(&self, requester: ProcessId) -> usize {
        self.requests.iter().filter(|r| r.requester == requester).count()
    }

    fn forget_request(&mut self, id: MessageId) {
        self.requests.retain(|r| r.id != id);
    }

    /// A reply from `replier` answers the oldest request `requester` sent it.
    fn answer(&mut self, replier: ProcessId, requester: ProcessId) {
        if let Some(i) = self
            .requests
            .iter()
            .position(|r| r.target == replier && r.requester == requester)
        {
            self.requests.remove(i);
        }
    }

    fn next_sequence(&self, source: ProcessId, target: ProcessId) -> u64 {
        self.sequences.get(&(source, target)).copied().unwrap_or(0) + 1
    }
}

/// Apply `event` to `pid`, tolerating pids the scheduler does not track.
fn wake_in(sched: &mut Scheduler, pid: ProcessId, event: WakeEvent) {
    match sched.wake(pid, event) {
        Ok(_) => {}
        // Drivers and the kernel have mailboxes but no scheduler record.
        Err(EstaError::UnknownProcess(_)) => debug!(%pid, ?event, "no scheduler record to wake"),
        Err(err) => warn!(%pid, ?event, %err, "wake failed"),
    }
}

/// The message router.
pub struct Router {
    state: Mutex<RouterState>,
    engine: Arc<CapabilityEngine>,
    audit: Arc<AuditLog>,
    scheduler: Arc<Mutex<Scheduler>>,
    clock: Arc<dyn Clock>,
    epoch_length: u32,
    floors: FairnessFloors,
}

impl Router {
    pub fn new(
        engine: Arc<CapabilityEngine>,
        audit: Arc<AuditLog>,
        scheduler: Arc<Mutex<Scheduler>>,
        clock: Arc<dyn Clock>,
        epoch_length: u32,
        floors: FairnessFloors,
    ) -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            engine,
            audit,
            scheduler,
            clock,
            epoch_length,
            floors,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sched(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── endpoints ──────────────────────────────────────────────────────────

    /// Create the mailbox for `pid`, reachable as `channel:<name>`.
    pub fn open_mailbox(
        &self,
        pid: ProcessId,
        name: &str,
        capacity: usize,
        policy: BackpressurePolicy,
    ) -> Result<(), EstaError> {
        let mut state = self.lock();
        if state.endpoints.contains_key(&pid) || state.endpoints.values().any(|e| e.name == name) {
            return Err(EstaError::AlreadyAdmitted {
                module: name.to_string(),
            });
        }
        state.endpoints.insert(
            pid,
            Endpoint {
                name: name.to_string(),
                open: true,
                mailbox: Mailbox::new(pid, capacity, policy, self.epoch_length, self.floors),
                notify: Arc::new(Notify::new()),
                request_limit: None,
            },
        );
        debug!(%pid, name, capacity, ?policy, "mailbox opened");
        Ok(())
    }

    /// Refuse `REPLY_EXPECTED` sends from `pid` once `limit` are outstanding.
    pub fn set_request_limit(&self, pid: ProcessId, limit: usize) -> Result<(), EstaError> {
        let mut state = self.lock();
        let endpoint = state
            .endpoints
            .get_mut(&pid)
            .ok_or(EstaError::UnknownProcess(pid))?;
        endpoint.request_limit = Some(limit);
        Ok(())
    }

    /// Close the mailbox of a terminated process.  Queued messages are
    /// dropped, audited, and returned; parked senders are released.
    ///
    /// Requests the process never answered, queued or already received, get
    /// a `ModuleTerminated` error reply.
    pub fn close_mailbox(&self, pid: ProcessId) -> Result<Vec<Message>, EstaError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let endpoint = state
            .endpoints
            .get_mut(&pid)
            .ok_or(EstaError::UnknownProcess(pid))?;
        endpoint.open = false;
        let dropped = endpoint.mailbox.drain();
        endpoint.notify.notify_one();

        let (orphaned, kept): (Vec<PendingRequest>, Vec<PendingRequest>) =
            std::mem::take(&mut state.requests)
                .into_iter()
                .partition(|r| r.target == pid);
        state.requests = kept;
        state.requests.retain(|r| r.requester != pid);

        let failure = EstaError::ModuleTerminated { pid };
        let mut answered = Vec::new();
        let mut lost = Vec::new();
        for request in orphaned {
            let reply = match Message::error_reply(pid, request.requester, request.priority, &failure) {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(%pid, requester = %request.requester, %err, "error reply not built");
                    continue;
                }
            };
            match self.deliver_system(state, reply) {
                Ok(evicted) => {
                    answered.push(request.requester);
                    lost.extend(evicted);
                }
                Err(undelivered) => {
                    warn!(%pid, requester = %request.requester, "error reply not delivered");
                    lost.push(undelivered);
                }
            }
        }
        drop(guard);

        {
            let mut sched = self.sched();
            for msg in &dropped {
                wake_in(&mut sched, msg.source, WakeEvent::SpaceFreed);
            }
            for &requester in &answered {
                wake_in(&mut sched, requester, WakeEvent::MessageArrived);
            }
        }
        if !answered.is_empty() {
            debug!(%pid, requesters = answered.len(), "pending requests failed");
        }
        self.audit_drops(&dropped, "target terminated")?;
        self.audit_drops(&lost, "error reply undeliverable")?;
        Ok(dropped)
    }

    /// Queue a router-originated message without a capability check.
    ///
    /// Returns the message evicted to make room, or hands `msg` back when
    /// its target cannot take it.
    fn deliver_system(
        &self,
        state: &mut RouterState,
        mut msg: Message,
    ) -> Result<Option<Message>, Message> {
        let sequence = state.next_sequence(msg.source, msg.target);
        let Some(endpoint) = state.endpoints.get_mut(&msg.target).filter(|e| e.open) else {
            return Err(msg);
        };
        msg.sequence = sequence;
        msg.timestamp = self.clock.now_ms();
        let key = (msg.source, msg.target);
        let evicted = match endpoint.mailbox.push(msg) {
            PushOutcome::Queued => None,
            PushOutcome::Evicted(oldest) => Some(oldest),
            PushOutcome::Dropped(msg) | PushOutcome::Full(msg) => return Err(msg),
        };
        endpoint.notify.notify_one();
        state.sequences.insert(key, sequence);
        if let Some(oldest) = &evicted {
            state.forget_request(oldest.id);
        }
        Ok(evicted)
    }

    /// Start a new delivery-floor epoch in every mailbox.
    pub fn start_epoch(&self) {
        for endpoint in self.lock().endpoints.values_mut() {
            endpoint.mailbox.reset_epoch();
        }
    }

    /// `REPLY_EXPECTED` messages `pid` has sent that are still unanswered.
    pub fn outstanding_requests(&self, pid: ProcessId) -> usize {
        self.lock().outstanding(pid)
    }

    pub fn lookup(&self, name: &str) -> Option<ProcessId> {
        self.lock()
            .endpoints
            .iter()
            .find(|(_, e)| e.name == name)
            .map(|(&pid, _)| pid)
    }

    pub fn name_of(&self, pid: ProcessId) -> Option<String> {
        self.lock().endpoints.get(&pid).map(|e| e.name.clone())
    }

    pub fn is_open(&self, pid: ProcessId) -> bool {
        self.lock().endpoints.get(&pid).is_some_and(|e| e.open)
    }

    pub fn notifier(&self, pid: ProcessId) -> Option<Arc<Notify>> {
        self.lock().endpoints.get(&pid).map(|e| e.notify.clone())
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let state = self.lock();
        let mut out: Vec<EndpointInfo> = state
            .endpoints
            .iter()
            .map(|(&pid, e)| EndpointInfo {
                pid,
                name: e.name.clone(),
                open: e.open,
                state: e.mailbox.state(),
                len: e.mailbox.len(),
                stats: e.mailbox.stats(),
                delivery_epoch: e.mailbox.budget().epoch(),
                outstanding: state.outstanding(pid),
            })
            .collect();
        drop(state);
        out.sort_by_key(|e| e.pid);
        out
    }

    pub fn pending(&self, pid: ProcessId) -> usize {
        self.lock()
            .endpoints
            .get(&pid)
            .map_or(0, |e| e.mailbox.len())
    }

    // ── send ───────────────────────────────────────────────────────────────

    /// Route `msg` from `msg.source` to `msg.target`.
    ///
    /// `MailboxFull` is returned only under `NotifySender`; it consumes no
    /// sequence number and is not audited.  A `REPLY_EXPECTED` send beyond
    /// the source's request limit fails with `QuotaExceeded`.
    pub fn send(&self, mut msg: Message) -> Result<SendReceipt, EstaError> {
        let source = msg.source;
        let target = msg.target;
        let mut guard = self.lock();
        let state = &mut *guard;
        let request_limit = state.endpoints.get(&source).and_then(|e| e.request_limit);

        if !source.is_kernel() {
            let source_open = state.endpoints.get(&source).map(|e| e.open);
            match source_open {
                None => return Err(self.reject(source, target, EstaError::UnknownProcess(source))),
                Some(false) => {
                    return Err(self.reject(source, target, EstaError::ModuleTerminated { pid: source }));
                }
                Some(true) if self.is_terminated(source) => {
                    return Err(self.reject(source, target, EstaError::ModuleTerminated { pid: source }));
                }
                Some(true) => {}
            }
        }

        let Some(endpoint) = state.endpoints.get_mut(&target) else {
            return Err(self.reject(source, target, EstaError::UnknownProcess(target)));
        };

        let channel = ResourceRef::channel(endpoint.name.clone());
        if let Err(err) = self.engine.authorize(source, &channel, Rights::SEND) {
            return Err(self.reject(source, target, err));
        }
        if !endpoint.open || self.is_terminated(target) {
            return Err(self.reject(source, target, EstaError::ModuleTerminated { pid: target }));
        }
        let size = msg.payload.len();
        if size > MAX_PAYLOAD_BYTES {
            return Err(self.reject(source, target, EstaError::PayloadTooLarge { size }));
        }
        let expects_reply = msg.flags.contains(MessageFlags::REPLY_EXPECTED);
        if expects_reply
            && let Some(limit) = request_limit
            && state.requests.iter().filter(|r| r.requester == source).count() >= limit
        {
            return Err(self.reject(source, target, EstaError::QuotaExceeded { pid: source }));
        }

        let key = (source, target);
        let sequence = state.sequences.get(&key).copied().unwrap_or(0) + 1;
        msg.sequence = sequence;
        msg.timestamp = self.clock.now_ms();
        let id = msg.id;
        let is_reply = msg.flags.contains(MessageFlags::REPLY);
        let pending = PendingRequest {
            id,
            requester: source,
            target,
            priority: msg.priority,
        };

        let block_sender = endpoint.mailbox.policy() == BackpressurePolicy::BlockSender;
        let outcome = if block_sender && endpoint.mailbox.has_parked() {
            PushOutcome::Full(msg)
        } else {
            endpoint.mailbox.push(msg)
        };

        let disposition = match outcome {
            PushOutcome::Queued => {
                endpoint.notify.notify_one();
                self.wake(target, WakeEvent::MessageArrived);
                Disposition::Queued
            }
            PushOutcome::Evicted(oldest) => {
                endpoint.notify.notify_one();
                self.wake(target, WakeEvent::MessageArrived);
                let evicted = oldest.id;
                state.requests.retain(|r| r.id != evicted);
                self.audit_drops(&[oldest], "evicted by drop_oldest")?;
                Disposition::Evicted(evicted)
            }
            PushOutcome::Dropped(newest) => {
                self.audit_drops(&[newest], "mailbox full")?;
                Disposition::Dropped
            }
            PushOutcome::Full(msg) if block_sender => {
                endpoint.mailbox.park(msg);
                if !source.is_kernel() {
                    match self.sched().block(source, WaitReason::MailboxSpace(target)) {
                        Ok(()) => {}
                        Err(EstaError::UnknownProcess(_)) => {
                            debug!(%source, %target, "parked sender has no scheduler record");
                        }
                        Err(err) => warn!(%source, %target, %err, "parked sender not blocked"),
                    }
                }
                debug!(%source, %target, "sender parked on full mailbox");
                Disposition::Parked
            }
            PushOutcome::Full(_) => {
                debug!(%source, %target, "mailbox full");
                return Err(EstaError::MailboxFull { target });
            }
        };

        state.sequences.insert(key, sequence);
        if is_reply {
            state.answer(source, target);
        }
        if expects_reply && disposition != Disposition::Dropped {
            state.requests.push(pending);
        }
        Ok(SendReceipt {
            id,
            sequence,
            disposition,
        })
    }

    fn is_terminated(&self, pid: ProcessId) -> bool {
        matches!(self.sched().state(pid), Some(ProcessState::Terminated(_)))
    }

    fn wake(&self, pid: ProcessId, event: WakeEvent) {
        wake_in(&mut self.sched(), pid, event);
    }

    fn reject(&self, source: ProcessId, target: ProcessId, err: EstaError) -> EstaError {
        warn!(%source, %target, error = %err, "message rejected");
        if let Err(audit_err) = self.audit.append(
            AuditEvent::MessageRejected {
                source,
                target,
                reason: err.to_string(),
            },
            AUDIT_SOURCE,
        ) {
            warn!(error = %audit_err, "audit append failed");
        }
        err
    }

    fn audit_drops(&self, messages: &[Message], reason: &str) -> Result<(), EstaError> {
        if messages.is_empty() {
            return Ok(());
        }
        let events = messages
            .iter()
            .map(|m| AuditEvent::MessageDropped {
                message_id: m.id,
                source: m.source,
                target: m.target,
                reason: reason.to_string(),
            })
            .collect();
        self.audit.append_batch(events, AUDIT_SOURCE)?;
        Ok(())
    }

    // ── receive ────────────────────────────────────────────────────────────

    /// Take the next message for `pid`, if any, and audit its delivery.
    ///
    /// Freed room admits parked messages and wakes their senders.
    pub fn receive(&self, pid: ProcessId) -> Result<Option<Message>, EstaError> {
        let mut state = self.lock();
        let endpoint = state
            .endpoints
            .get_mut(&pid)
            .ok_or(EstaError::UnknownProcess(pid))?;
        let Some(msg) = endpoint.mailbox.pop() else {
            return Ok(None);
        };

        if let Err(err) = self.audit.append(
            AuditEvent::MessageDelivered {
                message_id: msg.id,
                source: msg.source,
                target: msg.target,
                sequence: msg.sequence,
            },
            AUDIT_SOURCE,
        ) {
            endpoint.mailbox.requeue_front(msg);
            return Err(err);
        }

        let admitted = endpoint.mailbox.admit_parked();
        let released: Vec<ProcessId> = admitted
            .into_iter()
            .filter(|sender| !endpoint.mailbox.parked_senders().any(|p| p == *sender))
            .collect();
        drop(state);
        for sender in released {
            self.wake(sender, WakeEvent::SpaceFreed);
        }
        Ok(Some(msg))
    }

    /// Wait for the next message for `pid`.
    pub async fn recv(&self, pid: ProcessId) -> Result<Message, EstaError> {
        let notify = self.notifier(pid).ok_or(EstaError::UnknownProcess(pid))?;
        loop {
            if let Some(msg) = self.receive(pid)? {
                return Ok(msg);
            }
            if !self.is_open(pid) {
                return Err(EstaError::ModuleTerminated { pid });
            }
            notify.notified().await;
        }
    }

    /// Drain every undelivered message sent by `pid` without delivering it.
    /// Requests it was still waiting on are abandoned.
    pub fn purge_from(&self, pid: ProcessId) -> Result<usize, EstaError> {
        let removed: Vec<Message> = {
            let mut state = self.lock();
            state.requests.retain(|r| r.requester != pid);
            state
                .endpoints
                .values_mut()
                .flat_map(|e| e.mailbox.remove_from(pid))
                .collect()
        };
        self.audit_drops(&removed, "source terminated")?;
        Ok(removed.len())
    }
}
