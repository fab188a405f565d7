//! Per-process inbound queue with a backpressure policy.
//!
//! ```text
//! Empty ──push──▶ HasMessages ──push──▶ Full
//!   ▲                 │  ▲                 │
//!   └──────pop────────┘  └──────pop────────┘
//! ```
//!
//! Messages are kept in one FIFO per priority class.  `pop` picks the class
//! through the mailbox's own [`FairnessBudget`], so a saturated high class
//! never starves a lower one.  `DropOldest` evicts only within the incoming
//! message's class; when that class is empty the incoming message is dropped
//! instead.

use std::collections::VecDeque;

use esta_kernel::fairness::{FairnessBudget, FairnessFloors};
use esta_types::{BackpressurePolicy, Message, Priority, ProcessId};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MailboxState {
    Empty,
    HasMessages,
    Full,
}

/// Result of [`Mailbox::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The incoming message was discarded.
    Dropped(Message),
    /// The incoming message was queued after evicting this one.
    Evicted(Message),
    /// Full under `NotifySender` or `BlockSender`; the caller decides.
    Full(Message),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MailboxStats {
    pub queued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
    pub parked: u64,
}

#[derive(Debug)]
pub struct Mailbox {
    owner: ProcessId,
    capacity: usize,
    policy: BackpressurePolicy,
    queues: [VecDeque<Message>; 4],
    len: usize,
    budget: FairnessBudget,
    /// Senders' messages waiting for room under `BlockSender`.
    parked: VecDeque<Message>,
    stats: MailboxStats,
}

impl Mailbox {
    pub fn new(
        owner: ProcessId,
        capacity: usize,
        policy: BackpressurePolicy,
        epoch_length: u32,
        floors: FairnessFloors,
    ) -> Self {
        Self {
            owner,
            capacity: capacity.max(1),
            policy,
            queues: Default::default(),
            len: 0,
            budget: FairnessBudget::new(epoch_length, floors),
            parked: VecDeque::new(),
            stats: MailboxStats::default(),
        }
    }

    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    pub fn class_len(&self, class: Priority) -> usize {
        self.queues[class.index()].len()
    }

    pub fn state(&self) -> MailboxState {
        if self.len == 0 {
            MailboxState::Empty
        } else if self.is_full() {
            MailboxState::Full
        } else {
            MailboxState::HasMessages
        }
    }

    pub fn stats(&self) -> MailboxStats {
        self.stats
    }

    /// Delivery budget used by [`pop`](Self::pop).
    pub fn budget(&self) -> &FairnessBudget {
        &self.budget
    }

    /// Restart the delivery floors with the kernel's epoch.
    pub fn reset_epoch(&mut self) {
        self.budget.reset_epoch();
    }

    /// Enqueue `msg`, applying the backpressure policy when full.
    pub fn push(&mut self, msg: Message) -> PushOutcome {
        if !self.is_full() {
            self.enqueue(msg);
            return PushOutcome::Queued;
        }
        match self.policy {
            BackpressurePolicy::DropNewest => {
                self.stats.dropped += 1;
                PushOutcome::Dropped(msg)
            }
            BackpressurePolicy::DropOldest => {
                match self.queues[msg.priority.index()].pop_front() {
                    Some(oldest) => {
                        self.len -= 1;
                        self.stats.evicted += 1;
                        self.enqueue(msg);
                        PushOutcome::Evicted(oldest)
                    }
                    None => {
                        self.stats.dropped += 1;
                        PushOutcome::Dropped(msg)
                    }
                }
            }
            BackpressurePolicy::BlockSender | BackpressurePolicy::NotifySender => {
                PushOutcome::Full(msg)
            }
        }
    }

    fn enqueue(&mut self, msg: Message) {
        self.queues[msg.priority.index()].push_back(msg);
        self.len += 1;
        self.stats.queued += 1;
    }

    /// Dequeue the next message by class floor, FIFO within the class.
    pub fn pop(&mut self) -> Option<Message> {
        let ready = [0usize, 1, 2, 3].map(|i| !self.queues[i].is_empty());
        let class = self.budget.select(ready)?;
        let msg = self.queues[class.index()].pop_front()?;
        self.len -= 1;
        self.stats.delivered += 1;
        Some(msg)
    }

    /// Undo a [`pop`](Self::pop) whose delivery could not be recorded.
    pub fn requeue_front(&mut self, msg: Message) {
        self.queues[msg.priority.index()].push_front(msg);
        self.len += 1;
        self.stats.delivered = self.stats.delivered.saturating_sub(1);
    }

    // ── BlockSender parking ────────────────────────────────────────────────

    pub fn has_parked(&self) -> bool {
        !self.parked.is_empty()
    }

    pub fn park(&mut self, msg: Message) {
        self.stats.parked += 1;
        self.parked.push_back(msg);
    }

    /// Move parked messages in while there is room, oldest first.
    pub fn admit_parked(&mut self) -> Vec<ProcessId> {
        let mut senders = Vec::new();
        while !self.is_full() {
            let Some(msg) = self.parked.pop_front() else {
                break;
            };
            senders.push(msg.source);
            self.enqueue(msg);
        }
        senders
    }

    /// Senders with parked messages left.
    pub fn parked_senders(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.parked.iter().map(|m| m.source)
    }

    // ── purge ──────────────────────────────────────────────────────────────

    /// Remove every queued or parked message sent by `source`.
    pub fn remove_from(&mut self, source: ProcessId) -> Vec<Message> {
        let mut removed = Vec::new();
        for queue in &mut self.queues {
            let (gone, kept): (VecDeque<Message>, VecDeque<Message>) =
                queue.drain(..).partition(|m| m.source == source);
            *queue = kept;
            removed.extend(gone);
        }
        self.len -= removed.len();
        let (gone, kept): (VecDeque<Message>, VecDeque<Message>) =
            self.parked.drain(..).partition(|m| m.source == source);
        self.parked = kept;
        removed.extend(gone);
        removed
    }

    /// Empty the mailbox, parked messages included.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut all: Vec<Message> = self.queues.iter_mut().flat_map(|q| q.drain(..)).collect();
        all.extend(self.parked.drain(..));
        self.len = 0;
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox(capacity: usize, policy: BackpressurePolicy) -> Mailbox {
        Mailbox::new(ProcessId(1), capacity, policy, 64, FairnessFloors::default())
    }

    fn msg(source: u32, priority: Priority, tag: u8) -> Message {
        Message::new(ProcessId(source), ProcessId(1), priority, vec![tag])
    }

    #[test]
    fn state_machine_follows_occupancy() {
        let mut mb = mailbox(2, BackpressurePolicy::NotifySender);
        assert_eq!(mb.state(), MailboxState::Empty);
        mb.push(msg(2, Priority::Normal, 1));
        assert_eq!(mb.state(), MailboxState::HasMessages);
        mb.push(msg(2, Priority::Normal, 2));
        assert_eq!(mb.state(), MailboxState::Full);
        mb.pop();
        assert_eq!(mb.state(), MailboxState::HasMessages);
    }

    #[test]
    fn fifo_within_a_class() {
        let mut mb = mailbox(8, BackpressurePolicy::NotifySender);
        for tag in 0..5 {
            mb.push(msg(2, Priority::High, tag));
        }
        let tags: Vec<u8> = std::iter::from_fn(|| mb.pop()).map(|m| m.payload[0]).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn critical_drains_before_low() {
        let mut mb = mailbox(8, BackpressurePolicy::NotifySender);
        mb.push(msg(2, Priority::Low, 0));
        mb.push(msg(3, Priority::Critical, 1));
        assert_eq!(mb.pop().unwrap().priority, Priority::Critical);
        assert_eq!(mb.pop().unwrap().priority, Priority::Low);
    }

    #[test]
    fn drop_newest_discards_incoming() {
        let mut mb = mailbox(1, BackpressurePolicy::DropNewest);
        mb.push(msg(2, Priority::Normal, 1));
        let out = mb.push(msg(2, Priority::Normal, 2));
        assert!(matches!(out, PushOutcome::Dropped(m) if m.payload == vec![2]));
        assert_eq!(mb.pop().unwrap().payload, vec![1]);
    }

    #[test]
    fn drop_oldest_evicts_within_class_only() {
        let mut mb = mailbox(2, BackpressurePolicy::DropOldest);
        mb.push(msg(2, Priority::Normal, 1));
        mb.push(msg(2, Priority::Normal, 2));
        let out = mb.push(msg(2, Priority::Normal, 3));
        assert!(matches!(out, PushOutcome::Evicted(m) if m.payload == vec![1]));

        // No Critical message is queued, so a full box drops the newcomer.
        let out = mb.push(msg(2, Priority::Critical, 4));
        assert!(matches!(out, PushOutcome::Dropped(m) if m.payload == vec![4]));
        assert_eq!(mb.class_len(Priority::Normal), 2);
        assert_eq!(mb.stats().evicted, 1);
        assert_eq!(mb.stats().dropped, 1);
    }

    #[test]
    fn notify_and_block_hand_the_message_back() {
        for policy in [BackpressurePolicy::NotifySender, BackpressurePolicy::BlockSender] {
            let mut mb = mailbox(1, policy);
            mb.push(msg(2, Priority::Normal, 1));
            assert!(matches!(mb.push(msg(2, Priority::Normal, 2)), PushOutcome::Full(_)));
            assert_eq!(mb.len(), 1);
        }
    }

    #[test]
    fn parked_messages_enter_in_order_as_room_frees() {
        let mut mb = mailbox(1, BackpressurePolicy::BlockSender);
        mb.push(msg(2, Priority::Normal, 1));
        mb.park(msg(3, Priority::Normal, 2));
        mb.park(msg(4, Priority::Normal, 3));
        assert!(mb.admit_parked().is_empty());
        mb.pop();
        assert_eq!(mb.admit_parked(), vec![ProcessId(3)]);
        assert_eq!(mb.parked_senders().collect::<Vec<_>>(), vec![ProcessId(4)]);
        assert_eq!(mb.pop().unwrap().payload, vec![2]);
    }

    #[test]
    fn reset_epoch_restarts_the_delivery_floors() {
        let mut mb = mailbox(16, BackpressurePolicy::NotifySender);
        for tag in 0..10 {
            mb.push(msg(2, Priority::Critical, tag));
        }
        mb.push(msg(3, Priority::Low, 99));
        for _ in 0..5 {
            assert_eq!(mb.pop().unwrap().priority, Priority::Critical);
        }
        assert_eq!(mb.budget().attempts(), 5);
        let epoch = mb.budget().epoch();

        mb.reset_epoch();
        assert_eq!(mb.budget().attempts(), 0);
        assert_eq!(mb.budget().served(Priority::Critical), 0);
        assert_eq!(mb.budget().epoch(), epoch + 1);
    }

    #[test]
    fn remove_from_purges_queued_and_parked() {
        let mut mb = mailbox(2, BackpressurePolicy::BlockSender);
        mb.push(msg(2, Priority::Normal, 1));
        mb.push(msg(3, Priority::Low, 2));
        mb.park(msg(2, Priority::High, 3));
        let removed = mb.remove_from(ProcessId(2));
        assert_eq!(removed.len(), 2);
        assert_eq!(mb.len(), 1);
        assert!(!mb.has_parked());
        assert_eq!(mb.drain().len(), 1);
        assert!(mb.is_empty());
    }
}
