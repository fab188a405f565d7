//! [`AuthorityTable`] – the static record of which module may request what.
//!
//! The table is configured by the operator, never by modules.  At admission
//! the loader binds a module's entries to its pid inside the
//! [`CapabilityEngine`](crate::capability::CapabilityEngine); every later
//! `request` is judged against that binding.

use std::collections::HashMap;

use esta_types::{CapabilityRequest, EstaError, ResourceRef, Rights};

/// Maps module names to the capability classes they are authorized to request.
///
/// # Example
///
/// ```
/// use esta_kernel::authority::AuthorityTable;
/// use esta_types::{ResourceKind, ResourceRef, Rights};
///
/// let mut table = AuthorityTable::new();
/// table.allow_str("accrual", "db:read").unwrap();
///
/// assert!(table.permits("accrual", &ResourceRef::any(ResourceKind::Database), Rights::READ));
/// assert!(!table.permits("accrual", &ResourceRef::any(ResourceKind::Database), Rights::WRITE));
/// ```
#[derive(Debug, Clone, Default)]
pub struct AuthorityTable {
    entries: HashMap<String, Vec<CapabilityRequest>>,
}

impl AuthorityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `module → ["db:read", "messaging:send:ui", ...]`.
    pub fn from_map(map: &HashMap<String, Vec<String>>) -> Result<Self, EstaError> {
        let mut table = Self::new();
        for (module, caps) in map {
            for cap in caps {
                table.allow_str(module, cap)?;
            }
        }
        Ok(table)
    }

    /// Authorize `module` to request `entry`.  Duplicates are ignored.
    pub fn allow(&mut self, module: &str, entry: CapabilityRequest) {
        let list = self.entries.entry(module.to_string()).or_default();
        if !list.contains(&entry) {
            list.push(entry);
        }
    }

    /// Parse and authorize a capability string.
    pub fn allow_str(&mut self, module: &str, capability: &str) -> Result<(), EstaError> {
        self.allow(module, capability.parse()?);
        Ok(())
    }

    /// Remove every entry for `module`.
    pub fn forget(&mut self, module: &str) {
        self.entries.remove(module);
    }

    pub fn entries_for(&self, module: &str) -> Vec<CapabilityRequest> {
        self.entries.get(module).cloned().unwrap_or_default()
    }

    /// `true` when one entry covers both `resource` and every right in `rights`.
    pub fn permits(&self, module: &str, resource: &ResourceRef, rights: Rights) -> bool {
        permits(
            self.entries.get(module).map(Vec::as_slice).unwrap_or(&[]),
            resource,
            rights,
        )
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Shared coverage rule for authority lists.
pub(crate) fn permits(entries: &[CapabilityRequest], resource: &ResourceRef, rights: Rights) -> bool {
    entries
        .iter()
        .any(|e| e.resource.covers(resource) && rights.is_subset_of(e.rights))
}
