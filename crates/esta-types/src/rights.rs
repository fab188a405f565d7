//! [`Rights`] – the operations a capability permits.
//!
//! Rights form a bit set so that attenuation is a plain subset test: a
//! delegated capability is valid only when `child.rights ⊆ parent.rights`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Set of operations granted by a capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Rights: u16 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const DELETE = 1 << 2;
        const EXECUTE = 1 << 3;
        const CREATE = 1 << 4;
        const LIST = 1 << 5;
        const DELEGATE = 1 << 6;
        const REVOKE = 1 << 7;
        /// Enqueue a message on a channel.
        const SEND = 1 << 8;
        /// Dequeue from a channel.
        const RECEIVE = 1 << 9;
    }
}

impl Rights {
    /// Parse a single manifest action (`read`, `write`, `send`, ...).
    ///
    /// `admin` and `*` expand to every right.
    pub fn from_action(action: &str) -> Option<Rights> {
        let rights = match action.trim().to_ascii_lowercase().as_str() {
            "read" => Rights::READ,
            "write" => Rights::WRITE,
            "delete" => Rights::DELETE,
            "execute" | "exec" => Rights::EXECUTE,
            "create" => Rights::CREATE,
            "list" => Rights::LIST,
            "delegate" => Rights::DELEGATE,
            "revoke" => Rights::REVOKE,
            "send" => Rights::SEND,
            "receive" | "recv" => Rights::RECEIVE,
            "admin" | "*" => Rights::all(),
            _ => return None,
        };
        Some(rights)
    }

    /// `true` when every right in `self` is also held by `other`.
    pub fn is_subset_of(self, other: Rights) -> bool {
        other.contains(self)
    }

    /// Lower-case right names, used in audit events and error messages.
    pub fn names(self) -> Vec<String> {
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect()
    }
}
