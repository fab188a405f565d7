//! [`CapabilityEngine`] – the sole issuer and judge of capabilities.
//!
//! Capabilities live in an arena keyed by [`CapabilityId`].  Each slot keeps
//! its parent id and the ids of the children delegated from it, so revocation
//! cascades in O(descendants) without copying the graph.  Revoked
//! capabilities are flagged, never removed, so audit replay can still resolve
//! every id.
//!
//! | Operation | Mutates | Audited |
//! |---|---|---|
//! | [`request`](CapabilityEngine::request) | on grant | grant and denial |
//! | [`delegate`](CapabilityEngine::delegate) | on success | success and denial |
//! | [`validate`](CapabilityEngine::validate) | never | no |
//! | [`revoke`](CapabilityEngine::revoke) | first call | one entry per id, batched |
//!
//! Lock order is always table, then audit log.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use esta_types::{CapabilityId, CapabilityRequest, EstaError, ProcessId, ResourceRef, Rights};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::authority;
use crate::clock::Clock;

const AUDIT_SOURCE: &str = "capability-engine";

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Validity window in kernel milliseconds; `None` bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    pub not_before: Option<u64>,
    pub not_after: Option<u64>,
}

impl Validity {
    /// Valid forever.
    pub const ALWAYS: Validity = Validity {
        not_before: None,
        not_after: None,
    };

    /// Valid from now until `now + ttl_ms`.
    pub fn for_duration(now: u64, ttl_ms: u64) -> Self {
        Self {
            not_before: Some(now),
            not_after: Some(now.saturating_add(ttl_ms)),
        }
    }

    pub fn contains(&self, now: u64) -> bool {
        self.not_before.is_none_or(|nb| now >= nb) && self.not_after.is_none_or(|na| now <= na)
    }
}

/// An unforgeable token granting `rights` over `resource` to `owner`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub resource: ResourceRef,
    pub rights: Rights,
    pub owner: ProcessId,
    pub validity: Validity,
    pub revoked: bool,
    /// The capability this one was delegated from.
    pub parent: Option<CapabilityId>,
    pub created_at: u64,
}

impl Capability {
    pub fn is_live_at(&self, now: u64) -> bool {
        !self.revoked && self.validity.contains(now)
    }
}

/// Counters for the operator console.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityStats {
    pub total: usize,
    pub live: usize,
    pub revoked: usize,
    pub delegated: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// Arena
// ────────────────────────────────────────────────────────────────────────────

struct Slot {
    cap: Capability,
    children: Vec<CapabilityId>,
}

#[derive(Default)]
struct Table {
    slots: HashMap<CapabilityId, Slot>,
    by_owner: HashMap<ProcessId, Vec<CapabilityId>>,
    authority: HashMap<ProcessId, Vec<CapabilityRequest>>,
}

impl Table {
    fn insert(&mut self, cap: Capability) {
        if let Some(parent) = cap.parent
            && let Some(slot) = self.slots.get_mut(&parent)
        {
            slot.children.push(cap.id);
        }
        self.by_owner.entry(cap.owner).or_default().push(cap.id);
        self.slots.insert(
            cap.id,
            Slot {
                cap,
                children: Vec::new(),
            },
        );
    }

    /// Flag `root` and every live descendant, returning the newly revoked ids
    /// in depth-first order.
    fn cascade(&mut self, root: CapabilityId) -> Vec<CapabilityId> {
        let mut revoked = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            if slot.cap.revoked {
                // An earlier revocation already covered this subtree.
                continue;
            }
            slot.cap.revoked = true;
            revoked.push(id);
            stack.extend(slot.children.iter().rev().copied());
        }
        revoked
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CapabilityEngine
// ────────────────────────────────────────────────────────────────────────────

/// Issues, validates, delegates and revokes capabilities.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use esta_kernel::{AuditLog, CapabilityEngine, ManualClock};
/// use esta_types::{CapabilityRequest, ProcessId, ResourceKind, ResourceRef, Rights};
///
/// let clock = Arc::new(ManualClock::new(0));
/// let audit = Arc::new(AuditLog::new(clock.clone()));
/// let engine = CapabilityEngine::new(audit, clock);
///
/// let pid = ProcessId(1);
/// engine.bind_authority(pid, vec!["db:read".parse().unwrap()]);
///
/// let db = ResourceRef::any(ResourceKind::Database);
/// let cap = engine.request(db.clone(), Rights::READ, pid).unwrap();
/// assert!(engine.validate(cap.id, Rights::READ));
/// assert!(engine.request(db, Rights::WRITE, pid).is_err());
/// ```
pub struct CapabilityEngine {
    table: RwLock<Table>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl CapabilityEngine {
    pub fn new(audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            audit,
            clock,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── authority ──────────────────────────────────────────────────────────

    /// Bind the authority a process may request against.  Called by the
    /// loader at admission; replaces any earlier binding.
    pub fn bind_authority(&self, pid: ProcessId, entries: Vec<CapabilityRequest>) {
        self.write().authority.insert(pid, entries);
    }

    pub fn unbind_authority(&self, pid: ProcessId) {
        self.write().authority.remove(&pid);
    }

    // ── request ────────────────────────────────────────────────────────────

    /// Mint a capability for `requester`, valid forever.
    pub fn request(
        &self,
        resource: ResourceRef,
        rights: Rights,
        requester: ProcessId,
    ) -> Result<Capability, EstaError> {
        self.request_with_validity(resource, rights, requester, Validity::ALWAYS)
    }

    /// Mint a capability with an explicit validity window.
    ///
    /// Denials leave no state behind beyond their audit entry.  The kernel
    /// pid holds full authority.
    pub fn request_with_validity(
        &self,
        resource: ResourceRef,
        rights: Rights,
        requester: ProcessId,
        validity: Validity,
    ) -> Result<Capability, EstaError> {
        let mut table = self.write();

        let denial = if rights.is_empty() {
            Some("empty rights".to_string())
        } else if requester.is_kernel() {
            None
        } else {
            let entries = table.authority.get(&requester).map(Vec::as_slice).unwrap_or(&[]);
            (!authority::permits(entries, &resource, rights)).then(|| {
                format!(
                    "{requester} has no authority for {resource} [{}]",
                    rights.names().join("+")
                )
            })
        };

        if let Some(reason) = denial {
            warn!(%requester, %resource, %reason, "capability request denied");
            self.audit_best_effort(AuditEvent::CapabilityDenied {
                requester,
                resource: resource.to_string(),
                reason: reason.clone(),
            });
            return Err(EstaError::Denied { reason });
        }

        let cap = Capability {
            id: CapabilityId::mint(),
            resource,
            rights,
            owner: requester,
            validity,
            revoked: false,
            parent: None,
            created_at: self.clock.now_ms(),
        };
        self.audit.append(
            AuditEvent::CapabilityGranted {
                cap_id: cap.id,
                owner: requester,
                resource: cap.resource.to_string(),
                rights: cap.rights.names(),
            },
            AUDIT_SOURCE,
        )?;
        info!(cap = %cap.id, owner = %requester, resource = %cap.resource, "capability granted");
        table.insert(cap.clone());
        Ok(cap)
    }

    // ── delegate ───────────────────────────────────────────────────────────

    /// Derive a child of `source` for `target` holding exactly `subset`.
    ///
    /// Rights not held by the source are rejected outright, never clamped.
    /// The child inherits the source's resource and validity window.
    pub fn delegate(
        &self,
        source: CapabilityId,
        target: ProcessId,
        subset: Rights,
    ) -> Result<Capability, EstaError> {
        let mut table = self.write();
        let now = self.clock.now_ms();

        let parent = match table.slots.get(&source) {
            Some(slot) => slot.cap.clone(),
            None => {
                return Err(self.deny_delegation(
                    ProcessId::KERNEL,
                    "unknown",
                    EstaError::UnknownCapability(source),
                ));
            }
        };
        let resource = parent.resource.to_string();

        if parent.revoked {
            return Err(self.deny_delegation(
                parent.owner,
                &resource,
                EstaError::RevokedCapability(source),
            ));
        }
        if !parent.validity.contains(now) {
            return Err(self.deny_delegation(
                parent.owner,
                &resource,
                EstaError::Unauthorized {
                    reason: format!("{source} is outside its validity window"),
                },
            ));
        }
        if subset.is_empty() {
            return Err(self.deny_delegation(
                parent.owner,
                &resource,
                EstaError::InvalidCapability("delegation of empty rights".into()),
            ));
        }
        if !subset.is_subset_of(parent.rights) {
            return Err(self.deny_delegation(
                parent.owner,
                &resource,
                EstaError::AttenuationViolation {
                    requested: subset.names(),
                    held: parent.rights.names(),
                },
            ));
        }

        let child = Capability {
            id: CapabilityId::mint(),
            resource: parent.resource.clone(),
            rights: subset,
            owner: target,
            validity: parent.validity,
            revoked: false,
            parent: Some(source),
            created_at: now,
        };
        self.audit.append(
            AuditEvent::CapabilityDelegated {
                parent: source,
                child: child.id,
                target,
                rights: subset.names(),
            },
            AUDIT_SOURCE,
        )?;
        info!(parent = %source, child = %child.id, %target, "capability delegated");
        table.insert(child.clone());
        Ok(child)
    }

    fn deny_delegation(&self, requester: ProcessId, resource: &str, err: EstaError) -> EstaError {
        warn!(%requester, error = %err, "delegation denied");
        self.audit_best_effort(AuditEvent::CapabilityDenied {
            requester,
            resource: resource.to_string(),
            reason: err.to_string(),
        });
        err
    }

    // ── validate / check ───────────────────────────────────────────────────

    /// `true` when `id` exists, is not revoked, is inside its validity
    /// window and holds every right in `required`.  Never mutates.
    pub fn validate(&self, id: CapabilityId, required: Rights) -> bool {
        let now = self.clock.now_ms();
        self.read()
            .slots
            .get(&id)
            .is_some_and(|s| s.cap.is_live_at(now) && required.is_subset_of(s.cap.rights))
    }

    /// Full access check: `holder` must own `id`, which must cover `wanted`
    /// with `required` rights.
    pub fn check(
        &self,
        id: CapabilityId,
        holder: ProcessId,
        wanted: &ResourceRef,
        required: Rights,
    ) -> Result<(), EstaError> {
        let now = self.clock.now_ms();
        let table = self.read();
        let cap = &table
            .slots
            .get(&id)
            .ok_or_else(|| EstaError::Unauthorized {
                reason: format!("{id} is unknown"),
            })?
            .cap;
        let reason = if cap.owner != holder {
            format!("{id} is not held by {holder}")
        } else if cap.revoked {
            format!("{id} has been revoked")
        } else if !cap.validity.contains(now) {
            format!("{id} is outside its validity window")
        } else if !cap.resource.covers(wanted) {
            format!("{id} does not cover {wanted}")
        } else if !required.is_subset_of(cap.rights) {
            format!("{id} lacks [{}]", required.difference(cap.rights).names().join("+"))
        } else {
            return Ok(());
        };
        Err(EstaError::Unauthorized { reason })
    }

    /// A live capability held by `holder` that covers `wanted` with
    /// `required` rights.
    pub fn find(
        &self,
        holder: ProcessId,
        wanted: &ResourceRef,
        required: Rights,
    ) -> Option<CapabilityId> {
        let now = self.clock.now_ms();
        let table = self.read();
        table.by_owner.get(&holder)?.iter().copied().find(|id| {
            table.slots.get(id).is_some_and(|s| {
                s.cap.is_live_at(now)
                    && s.cap.resource.covers(wanted)
                    && required.is_subset_of(s.cap.rights)
            })
        })
    }

    /// Locate a capability for `holder` and re-validate it, in one step.
    ///
    /// This is the router's per-send authorization.
    pub fn authorize(
        &self,
        holder: ProcessId,
        wanted: &ResourceRef,
        required: Rights,
    ) -> Result<CapabilityId, EstaError> {
        let id = self.find(holder, wanted, required).ok_or_else(|| EstaError::Unauthorized {
            reason: format!(
                "{holder} holds no capability for {wanted} [{}]",
                required.names().join("+")
            ),
        })?;
        if self.validate(id, required) {
            Ok(id)
        } else {
            Err(EstaError::Unauthorized {
                reason: format!("{id} failed validation"),
            })
        }
    }

    // ── revoke ─────────────────────────────────────────────────────────────

    /// Revoke `id` and every descendant, returning how many were newly
    /// revoked.
    ///
    /// One `CapabilityRevoked` entry is appended per affected id as a single
    /// contiguous batch.  Revoking an already-revoked capability succeeds and
    /// appends one entry flagged `noop`.  The flags are set even when the
    /// audit write fails; the audit error is then returned.
    pub fn revoke(&self, id: CapabilityId) -> Result<usize, EstaError> {
        let mut table = self.write();
        if !table.slots.contains_key(&id) {
            return Err(EstaError::UnknownCapability(id));
        }
        let revoked = table.cascade(id);

        let events = if revoked.is_empty() {
            vec![AuditEvent::CapabilityRevoked {
                cap_id: id,
                root: id,
                noop: true,
            }]
        } else {
            revoked
                .iter()
                .map(|&cap_id| AuditEvent::CapabilityRevoked {
                    cap_id,
                    root: id,
                    noop: false,
                })
                .collect()
        };
        info!(root = %id, count = revoked.len(), "capability revoked");
        self.audit.append_batch(events, AUDIT_SOURCE)?;
        Ok(revoked.len())
    }

    /// Revoke every capability owned by `pid`, cascading to anything it
    /// delegated onward.
    pub fn revoke_owner(&self, pid: ProcessId) -> Result<usize, EstaError> {
        let owned: Vec<CapabilityId> = {
            let table = self.read();
            table
                .by_owner
                .get(&pid)
                .map(|ids| {
                    ids.iter()
                        .copied()
                        .filter(|id| table.slots.get(id).is_some_and(|s| !s.cap.revoked))
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut total = 0;
        for id in owned {
            if self.get(id).is_some_and(|c| !c.revoked) {
                total += self.revoke(id)?;
            }
        }
        Ok(total)
    }

    // ── queries ────────────────────────────────────────────────────────────

    pub fn get(&self, id: CapabilityId) -> Option<Capability> {
        self.read().slots.get(&id).map(|s| s.cap.clone())
    }

    pub fn children_of(&self, id: CapabilityId) -> Vec<CapabilityId> {
        self.read()
            .slots
            .get(&id)
            .map(|s| s.children.clone())
            .unwrap_or_default()
    }

    /// Every capability `pid` has ever held, revoked ones included.
    pub fn capabilities_of(&self, pid: ProcessId) -> Vec<Capability> {
        let table = self.read();
        table
            .by_owner
            .get(&pid)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| table.slots.get(id).map(|s| s.cap.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CapabilityStats {
        let now = self.clock.now_ms();
        let table = self.read();
        table
            .slots
            .values()
            .fold(CapabilityStats::default(), |mut acc, slot| {
                acc.total += 1;
                if slot.cap.revoked {
                    acc.revoked += 1;
                } else if slot.cap.validity.contains(now) {
                    acc.live += 1;
                }
                if slot.cap.parent.is_some() {
                    acc.delegated += 1;
                }
                acc
            })
    }

    fn audit_best_effort(&self, event: AuditEvent) {
        if let Err(err) = self.audit.append(event, AUDIT_SOURCE) {
            warn!(error = %err, "audit append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use esta_types::ResourceKind;

    struct Fixture {
        clock: Arc<ManualClock>,
        audit: Arc<AuditLog>,
        engine: CapabilityEngine,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let audit = Arc::new(AuditLog::new(clock.clone()));
        let engine = CapabilityEngine::new(audit.clone(), clock.clone());
        Fixture {
            clock,
            audit,
            engine,
        }
    }

    fn db() -> ResourceRef {
        ResourceRef::any(ResourceKind::Database)
    }

    fn grant_rw(f: &Fixture, pid: ProcessId) -> Capability {
        f.engine.bind_authority(pid, vec!["db:read+write".parse().unwrap()]);
        f.engine
            .request(db(), Rights::READ | Rights::WRITE, pid)
            .expect("grant")
    }

    #[test]
    fn request_without_authority_is_denied_without_state() {
        let f = fixture();
        let result = f.engine.request(db(), Rights::WRITE, ProcessId(1));
        assert!(matches!(result, Err(EstaError::Denied { .. })));
        assert_eq!(f.engine.len(), 0);
        let entries = f.audit.export();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].event, AuditEvent::CapabilityDenied { .. }));
    }

    #[test]
    fn kernel_holds_full_authority() {
        let f = fixture();
        let cap = f
            .engine
            .request(ResourceRef::any(ResourceKind::Channel), Rights::SEND, ProcessId::KERNEL)
            .unwrap();
        assert!(f.engine.validate(cap.id, Rights::SEND));
    }

    #[test]
    fn grant_is_audited_and_validates() {
        let f = fixture();
        let cap = grant_rw(&f, ProcessId(1));
        assert!(f.engine.validate(cap.id, Rights::READ));
        assert!(f.engine.validate(cap.id, Rights::READ | Rights::WRITE));
        assert!(!f.engine.validate(cap.id, Rights::DELETE));
        assert!(matches!(
            f.audit.export()[0].event,
            AuditEvent::CapabilityGranted { .. }
        ));
    }

    #[test]
    fn attenuation_chain_rejects_amplification() {
        let f = fixture();
        let a = grant_rw(&f, ProcessId(1));
        let b = f.engine.delegate(a.id, ProcessId(2), Rights::READ).unwrap();
        assert_eq!(b.parent, Some(a.id));
        let c = f
            .engine
            .delegate(b.id, ProcessId(3), Rights::READ | Rights::WRITE);
        assert!(matches!(c, Err(EstaError::AttenuationViolation { .. })));
        assert_eq!(f.engine.len(), 2, "no partial child was created");
    }

    #[test]
    fn delegate_from_revoked_fails() {
        let f = fixture();
        let a = grant_rw(&f, ProcessId(1));
        f.engine.revoke(a.id).unwrap();
        assert!(matches!(
            f.engine.delegate(a.id, ProcessId(2), Rights::READ),
            Err(EstaError::RevokedCapability(_))
        ));
    }

    #[test]
    fn revoke_cascades_to_descendants_in_one_batch() {
        let f = fixture();
        let a = grant_rw(&f, ProcessId(1));
        let b = f.engine.delegate(a.id, ProcessId(2), Rights::READ).unwrap();
        let c = f.engine.delegate(b.id, ProcessId(3), Rights::READ).unwrap();
        let d = f.engine.delegate(a.id, ProcessId(4), Rights::WRITE).unwrap();
        let before = f.audit.len();

        assert_eq!(f.engine.revoke(a.id).unwrap(), 4);
        for id in [a.id, b.id, c.id, d.id] {
            assert!(!f.engine.validate(id, Rights::empty()));
            assert!(f.engine.get(id).unwrap().revoked);
        }
        let revocations: Vec<_> = f.audit.entries_since(before as u64);
        assert_eq!(revocations.len(), 4);
        assert!(revocations.iter().all(|e| matches!(
            e.event,
            AuditEvent::CapabilityRevoked { noop: false, root, .. } if root == a.id
        )));
        assert!(f.audit.verify(..));
    }

    #[test]
    fn revoke_is_idempotent_with_noop_entry() {
        let f = fixture();
        let a = grant_rw(&f, ProcessId(1));
        f.engine.revoke(a.id).unwrap();
        let after_first = f.audit.len();
        assert_eq!(f.engine.revoke(a.id).unwrap(), 0);
        assert!(f.engine.get(a.id).unwrap().revoked);
        let extra = f.audit.entries_since(after_first as u64);
        assert_eq!(extra.len(), 1);
        assert!(matches!(
            extra[0].event,
            AuditEvent::CapabilityRevoked { noop: true, .. }
        ));
    }

    #[test]
    fn revoking_a_child_leaves_the_parent() {
        let f = fixture();
        let a = grant_rw(&f, ProcessId(1));
        let b = f.engine.delegate(a.id, ProcessId(2), Rights::READ).unwrap();
        f.engine.revoke(b.id).unwrap();
        assert!(f.engine.validate(a.id, Rights::WRITE));
        assert!(!f.engine.validate(b.id, Rights::READ));
    }

    #[test]
    fn expired_capability_fails_validation_and_delegation() {
        let f = fixture();
        let pid = ProcessId(1);
        f.engine.bind_authority(pid, vec!["db:read".parse().unwrap()]);
        let cap = f
            .engine
            .request_with_validity(db(), Rights::READ, pid, Validity::for_duration(1_000, 50))
            .unwrap();
        assert!(f.engine.validate(cap.id, Rights::READ));
        f.clock.advance(51);
        assert!(!f.engine.validate(cap.id, Rights::READ));
        assert!(matches!(
            f.engine.delegate(cap.id, ProcessId(2), Rights::READ),
            Err(EstaError::Unauthorized { .. })
        ));
    }

    #[test]
    fn check_requires_owner_and_resource_coverage() {
        let f = fixture();
        let pid = ProcessId(1);
        f.engine
            .bind_authority(pid, vec!["messaging:send:accrual".parse().unwrap()]);
        let cap = f
            .engine
            .request(ResourceRef::channel("accrual"), Rights::SEND, pid)
            .unwrap();
        assert!(f
            .engine
            .check(cap.id, pid, &ResourceRef::channel("accrual"), Rights::SEND)
            .is_ok());
        assert!(f
            .engine
            .check(cap.id, ProcessId(9), &ResourceRef::channel("accrual"), Rights::SEND)
            .is_err());
        assert!(f
            .engine
            .check(cap.id, pid, &ResourceRef::channel("ui"), Rights::SEND)
            .is_err());
        assert_eq!(
            f.engine
                .authorize(pid, &ResourceRef::channel("accrual"), Rights::SEND)
                .unwrap(),
            cap.id
        );
    }

    #[test]
    fn revoke_owner_cascades_through_delegations() {
        let f = fixture();
        let a = grant_rw(&f, ProcessId(1));
        let b = f.engine.delegate(a.id, ProcessId(2), Rights::READ).unwrap();
        assert_eq!(f.engine.revoke_owner(ProcessId(1)).unwrap(), 2);
        assert!(!f.engine.validate(b.id, Rights::READ));
        let stats = f.engine.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.revoked, 2);
        assert_eq!(stats.delegated, 1);
    }

    #[test]
    fn unknown_capability_never_validates() {
        let f = fixture();
        assert!(!f.engine.validate(CapabilityId::mint(), Rights::empty()));
        assert!(matches!(
            f.engine.revoke(CapabilityId::mint()),
            Err(EstaError::UnknownCapability(_))
        ));
    }
}
