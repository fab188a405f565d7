//! [`AuditLog`] – append-only, hash-chained record of security events.
//!
//! Every entry commits to its predecessor:
//!
//! ```text
//! hash = SHA-256(sequence ‖ timestamp ‖ event ‖ source ‖ prev_hash)
//! ```
//!
//! The genesis entry chains from `SHA-256("ESTA-KERNEL-GENESIS")`.  There is
//! no update or delete path.  Sequence reservation and the write of the entry
//! happen under one commit lock, which is the only serialization point in the
//! kernel.
//!
//! Once [`AuditLog::verify`] detects a broken link the log latches into a
//! corrupted state and refuses every further append with
//! [`EstaError::AuditChainCorruption`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use esta_kernel::audit::{AuditEvent, AuditLog};
//! use esta_kernel::clock::ManualClock;
//!
//! let log = AuditLog::new(Arc::new(ManualClock::new(0)));
//! log.append(AuditEvent::KernelStarted { version: "0.1.0".into() }, "kernel").unwrap();
//! assert!(log.verify(..));
//! ```

use std::ops::{Bound, RangeBounds};
use std::sync::{Arc, Mutex, PoisonError};

use esta_types::{CapabilityId, EstaError, MessageId, ProcessId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::clock::Clock;

const GENESIS_SEED: &[u8] = b"ESTA-KERNEL-GENESIS";

/// Hash every chain starts from.
pub fn genesis_hash() -> String {
    hex::encode(Sha256::digest(GENESIS_SEED))
}

// ────────────────────────────────────────────────────────────────────────────
// Events and entries
// ────────────────────────────────────────────────────────────────────────────

/// Security-relevant operations recorded in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuditEvent {
    KernelStarted {
        version: String,
    },
    KernelShutdown {
        reason: String,
    },
    CapabilityGranted {
        cap_id: CapabilityId,
        owner: ProcessId,
        resource: String,
        rights: Vec<String>,
    },
    CapabilityDenied {
        requester: ProcessId,
        resource: String,
        reason: String,
    },
    CapabilityDelegated {
        parent: CapabilityId,
        child: CapabilityId,
        target: ProcessId,
        rights: Vec<String>,
    },
    /// `noop` marks a revocation of an already-revoked capability.
    CapabilityRevoked {
        cap_id: CapabilityId,
        root: CapabilityId,
        noop: bool,
    },
    MessageDelivered {
        message_id: MessageId,
        source: ProcessId,
        target: ProcessId,
        sequence: u64,
    },
    MessageRejected {
        source: ProcessId,
        target: ProcessId,
        reason: String,
    },
    MessageDropped {
        message_id: MessageId,
        source: ProcessId,
        target: ProcessId,
        reason: String,
    },
    ModuleAdmitted {
        module: String,
        pid: ProcessId,
        version: String,
        checksum: String,
    },
    ModuleRejected {
        module: String,
        reason: String,
    },
    ModuleTerminated {
        pid: ProcessId,
        reason: String,
    },
    ModuleRestarted {
        module: String,
        attempt: u32,
    },
}

/// A committed link in the audit chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub event: AuditEvent,
    pub source: String,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    fn compute_hash(
        sequence: u64,
        timestamp: u64,
        event: &AuditEvent,
        source: &str,
        prev_hash: &str,
    ) -> Result<String, EstaError> {
        let encoded = serde_json::to_vec(event)
            .map_err(|e| EstaError::Wire(format!("audit event encoding: {e}")))?;
        let mut hasher = Sha256::new();
        hasher.update(sequence.to_le_bytes());
        hasher.update(timestamp.to_le_bytes());
        hasher.update(encoded);
        hasher.update(source.as_bytes());
        hasher.update(prev_hash.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Recompute this entry's hash from its own fields.
    pub fn recompute_hash(&self) -> Result<String, EstaError> {
        Self::compute_hash(
            self.sequence,
            self.timestamp,
            &self.event,
            &self.source,
            &self.prev_hash,
        )
    }

    /// `true` when the stored hash matches the recomputation.
    pub fn is_intact(&self) -> bool {
        self.recompute_hash().is_ok_and(|h| h == self.hash)
    }
}

/// Outcome of a chain verification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    /// Entries inside the requested range that were checked.
    pub entries_checked: u64,
    /// Sequence of the first broken entry, if any.
    pub first_invalid: Option<u64>,
}

/// Summary counters for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub entries: usize,
    pub head_sequence: u64,
    pub head_hash: String,
    pub corrupted: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// AuditLog
// ────────────────────────────────────────────────────────────────────────────

struct Chain {
    entries: Vec<AuditEntry>,
    last_hash: String,
    next_sequence: u64,
    corrupted_at: Option<u64>,
}

impl Chain {
    /// Nothing is reserved when hashing fails.
    fn commit(
        &mut self,
        timestamp: u64,
        event: AuditEvent,
        source: &str,
    ) -> Result<AuditEntry, EstaError> {
        let sequence = self.next_sequence;
        let hash = AuditEntry::compute_hash(sequence, timestamp, &event, source, &self.last_hash)?;
        self.next_sequence += 1;
        let prev_hash = std::mem::take(&mut self.last_hash);
        let entry = AuditEntry {
            sequence,
            timestamp,
            event,
            source: source.to_string(),
            prev_hash,
            hash: hash.clone(),
        };
        self.last_hash = hash;
        self.entries.push(entry.clone());
        Ok(entry)
    }
}

/// The append-only audit log shared by the capability engine, the router
/// and the loader.
pub struct AuditLog {
    chain: Mutex<Chain>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            chain: Mutex::new(Chain {
                entries: Vec::new(),
                last_hash: genesis_hash(),
                next_sequence: 1,
                corrupted_at: None,
            }),
            clock,
        }
    }

    /// Load an exported chain for independent verification.
    ///
    /// The entries are taken as-is; call [`AuditLog::verify`] before
    /// trusting them.
    pub fn import(entries: Vec<AuditEntry>, clock: Arc<dyn Clock>) -> Self {
        let last_hash = entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(genesis_hash);
        let next_sequence = entries.last().map(|e| e.sequence + 1).unwrap_or(1);
        Self {
            chain: Mutex::new(Chain {
                entries,
                last_hash,
                next_sequence,
                corrupted_at: None,
            }),
            clock,
        }
    }

    fn chain(&self) -> std::sync::MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one event.  This is the only mutation path.
    pub fn append(&self, event: AuditEvent, source: &str) -> Result<AuditEntry, EstaError> {
        let mut chain = self.chain();
        if let Some(sequence) = chain.corrupted_at {
            return Err(EstaError::AuditChainCorruption { sequence });
        }
        let entry = chain.commit(self.clock.now_ms(), event, source)?;
        debug!(seq = entry.sequence, source, event = ?entry.event, "audit append");
        Ok(entry)
    }

    /// Append several events as one contiguous run; no other writer can
    /// interleave.
    pub fn append_batch(
        &self,
        events: Vec<AuditEvent>,
        source: &str,
    ) -> Result<Vec<AuditEntry>, EstaError> {
        let mut chain = self.chain();
        if let Some(sequence) = chain.corrupted_at {
            return Err(EstaError::AuditChainCorruption { sequence });
        }
        let timestamp = self.clock.now_ms();
        events
            .into_iter()
            .map(|event| chain.commit(timestamp, event, source))
            .collect()
    }

    /// `true` when every entry with a sequence number in `range` is intact
    /// and correctly linked.
    ///
    /// Links are checked from genesis, threading the recomputed hash, so a
    /// damaged entry also invalidates every range ending after it.
    pub fn verify(&self, range: impl RangeBounds<u64>) -> bool {
        self.verify_report(range).valid
    }

    /// Like [`AuditLog::verify`] but reports where the chain broke.
    pub fn verify_report(&self, range: impl RangeBounds<u64>) -> ChainVerification {
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&e) => e,
            Bound::Excluded(&e) => e.saturating_sub(1),
            Bound::Unbounded => u64::MAX,
        };

        let mut chain = self.chain();
        let mut expected_prev = genesis_hash();
        let mut checked = 0u64;
        let mut first_invalid = None;

        for (index, entry) in chain.entries.iter().enumerate() {
            let position = index as u64 + 1;
            if position > end {
                break;
            }
            let linked = entry.prev_hash == expected_prev && entry.sequence == position;
            let recomputed = match entry.recompute_hash() {
                Ok(hash) if linked && hash == entry.hash => hash,
                _ => {
                    first_invalid = Some(position);
                    break;
                }
            };
            if position >= start {
                checked += 1;
            }
            expected_prev = recomputed;
        }

        if let Some(sequence) = first_invalid {
            error!(sequence, "audit chain corruption detected; log is now read-only");
            chain.corrupted_at.get_or_insert(sequence);
        }

        ChainVerification {
            valid: first_invalid.is_none(),
            entries_checked: checked,
            first_invalid,
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.chain().corrupted_at.is_some()
    }

    /// Copy of the full chain for external auditors.
    pub fn export(&self) -> Vec<AuditEntry> {
        self.chain().entries.clone()
    }

    /// Entries whose sequence number falls in `range`.
    pub fn entries(&self, range: impl RangeBounds<u64>) -> Vec<AuditEntry> {
        self.chain()
            .entries
            .iter()
            .filter(|e| range.contains(&e.sequence))
            .cloned()
            .collect()
    }

    pub fn entries_since(&self, after_sequence: u64) -> Vec<AuditEntry> {
        self.chain()
            .entries
            .iter()
            .filter(|e| e.sequence > after_sequence)
            .cloned()
            .collect()
    }

    pub fn entries_by_source(&self, source: &str) -> Vec<AuditEntry> {
        self.chain()
            .entries
            .iter()
            .filter(|e| e.source == source)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chain().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> AuditStats {
        let chain = self.chain();
        AuditStats {
            entries: chain.entries.len(),
            head_sequence: chain.next_sequence - 1,
            head_hash: chain.last_hash.clone(),
            corrupted: chain.corrupted_at.is_some(),
        }
    }
}
