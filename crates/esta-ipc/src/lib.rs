//! `esta-ipc` – Message Routing
//!
//! Moves typed messages between process mailboxes.  Every send is
//! authorized by the capability engine; nothing here grants authority.
//!
//! # Modules
//!
//! - [`wire`] – the 48-byte little-endian header codec.
//! - [`mailbox`] – [`Mailbox`][mailbox::Mailbox]: per-process priority
//!   queues with a backpressure policy and anti-starvation floors.
//! - [`router`] – [`Router`][router::Router]: capability-checked, sequenced
//!   delivery that wakes receivers and parks blocked senders through the
//!   scheduler.

pub mod mailbox;
pub mod router;
pub mod wire;

pub use mailbox::{Mailbox, MailboxState, MailboxStats, PushOutcome};
pub use router::{Disposition, EndpointInfo, Router, SendReceipt};
pub use wire::{HEADER_LEN, WireError};
