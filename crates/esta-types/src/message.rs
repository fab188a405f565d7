//! Typed IPC messages routed between modules.

use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::EstaError;
use crate::ids::{MessageId, ProcessId};

/// Largest payload the router and the wire codec accept (1 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Delivery and scheduling priority class.
///
/// The discriminant is the wire encoding (byte 40 of the header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// Every class, highest first.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Dense index (`Low = 0 .. Critical = 3`) for per-class arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            3 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Preemption quantum for a module running in this class.
    pub fn time_slice(self) -> Duration {
        match self {
            Self::Critical => Duration::from_millis(10),
            Self::High => Duration::from_millis(15),
            Self::Normal => Duration::from_millis(25),
            Self::Low => Duration::from_millis(100),
        }
    }
}

bitflags! {
    /// Header flag byte (offset 41).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MessageFlags: u8 {
        /// The sender awaits a reply.
        const REPLY_EXPECTED = 1 << 0;
        /// This message answers an earlier request.
        const REPLY = 1 << 1;
        /// Emitted by the kernel itself.
        const SYSTEM = 1 << 2;
        /// Addressed to or from a collaborator driver.
        const DRIVER = 1 << 3;
    }
}

/// Service-level message type, carried as the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Ping,
    Pong,
    AccrualRequest,
    AccrualResponse,
    AuditStart,
    AuditRecord,
    AuditEnd,
    /// A request failed; the body is the JSON-encoded [`EstaError`].
    Error,
    SystemShutdown,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        match self {
            Self::Ping => 0x01,
            Self::Pong => 0x02,
            Self::AccrualRequest => 0x10,
            Self::AccrualResponse => 0x11,
            Self::AuditStart => 0x20,
            Self::AuditRecord => 0x21,
            Self::AuditEnd => 0x22,
            Self::Error => 0xFE,
            Self::SystemShutdown => 0xFF,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let kind = match code {
            0x01 => Self::Ping,
            0x02 => Self::Pong,
            0x10 => Self::AccrualRequest,
            0x11 => Self::AccrualResponse,
            0x20 => Self::AuditStart,
            0x21 => Self::AuditRecord,
            0x22 => Self::AuditEnd,
            0xFE => Self::Error,
            0xFF => Self::SystemShutdown,
            _ => return None,
        };
        Some(kind)
    }
}

/// A message in flight between two processes.
///
/// `sequence` and `timestamp` are stamped by the router at send time; values
/// set by the sender are overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub source: ProcessId,
    pub target: ProcessId,
    pub sequence: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub priority: Priority,
    pub flags: MessageFlags,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(source: ProcessId, target: ProcessId, priority: Priority, payload: Vec<u8>) -> Self {
        Self {
            id: MessageId::new(),
            source,
            target,
            sequence: 0,
            timestamp: 0,
            priority,
            flags: MessageFlags::empty(),
            payload,
        }
    }

    /// Build a message whose payload is a bare type code followed by `body`.
    pub fn typed(
        source: ProcessId,
        target: ProcessId,
        priority: Priority,
        kind: MessageKind,
        body: &[u8],
    ) -> Self {
        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(kind.code());
        payload.extend_from_slice(body);
        Self::new(source, target, priority, payload)
    }

    /// A `SYSTEM | REPLY` message telling `target` its request failed.
    pub fn error_reply(
        source: ProcessId,
        target: ProcessId,
        priority: Priority,
        err: &EstaError,
    ) -> Result<Self, EstaError> {
        let body = serde_json::to_vec(err).map_err(|e| EstaError::Wire(e.to_string()))?;
        Ok(Self::typed(source, target, priority, MessageKind::Error, &body)
            .with_flags(MessageFlags::SYSTEM | MessageFlags::REPLY))
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The service-level type code, if the payload starts with a known one.
    pub fn kind(&self) -> Option<MessageKind> {
        self.payload.first().copied().and_then(MessageKind::from_code)
    }

    /// Payload bytes after the type code.
    pub fn body(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or_default()
    }

    /// The error carried by an `Error` reply.
    pub fn error(&self) -> Option<EstaError> {
        if self.kind() != Some(MessageKind::Error) {
            return None;
        }
        serde_json::from_slice(self.body()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_wire_encoding_matches_header_layout() {
        for p in Priority::DESCENDING {
            assert_eq!(Priority::from_wire(p as u8), Some(p));
        }
        assert_eq!(Priority::from_wire(4), None);
        assert!(Priority::Critical > Priority::Low);
    }

    #[test]
    fn time_slice_table() {
        assert_eq!(Priority::Critical.time_slice(), Duration::from_millis(10));
        assert_eq!(Priority::High.time_slice(), Duration::from_millis(15));
        assert_eq!(Priority::Normal.time_slice(), Duration::from_millis(25));
        assert_eq!(Priority::Low.time_slice(), Duration::from_millis(100));
    }

    #[test]
    fn message_kind_codes() {
        assert_eq!(MessageKind::Ping.code(), 0x01);
        assert_eq!(MessageKind::AccrualResponse.code(), 0x11);
        assert_eq!(MessageKind::from_code(0xFF), Some(MessageKind::SystemShutdown));
        assert_eq!(MessageKind::from_code(0x42), None);
    }

    #[test]
    fn typed_message_exposes_kind_and_body() {
        let msg = Message::typed(
            ProcessId(1),
            ProcessId(2),
            Priority::Normal,
            MessageKind::AccrualRequest,
            b"hours=40",
        );
        assert_eq!(msg.kind(), Some(MessageKind::AccrualRequest));
        assert_eq!(msg.body(), b"hours=40");
    }

    #[test]
    fn error_reply_carries_the_error() {
        let err = EstaError::ModuleTerminated { pid: ProcessId(7) };
        let msg = Message::error_reply(ProcessId(7), ProcessId(2), Priority::High, &err).unwrap();
        assert_eq!(msg.kind(), Some(MessageKind::Error));
        assert!(msg.flags.contains(MessageFlags::SYSTEM | MessageFlags::REPLY));
        assert_eq!(msg.error(), Some(err));

        let ping = Message::typed(ProcessId(1), ProcessId(2), Priority::Low, MessageKind::Ping, b"{}");
        assert_eq!(ping.error(), None);
    }

    #[test]
    fn empty_payload_has_no_kind() {
        let msg = Message::new(ProcessId(1), ProcessId(2), Priority::Low, Vec::new());
        assert_eq!(msg.kind(), None);
        assert!(msg.body().is_empty());
    }
}
