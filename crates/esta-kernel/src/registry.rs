//! [`ModuleRegistry`] – the loader that admits modules into the kernel.
//!
//! Admission runs in a fixed order and stops at the first failure:
//!
//! 1. **Signature** over every module in the batch, before anything else.
//! 2. **Shape**: required fields, semver, checksum, capability strings,
//!    limits, runtime, duplicates.
//! 3. **Dependencies**: each must be admitted already or co-admitted in the
//!    same batch; the batch is ordered topologically.
//! 4. **Grant**: every `capabilities_required` entry goes through
//!    [`CapabilityEngine::request`].  One denial rolls back every capability
//!    granted for the batch via `revoke`.
//! 5. **Register** with the [`Scheduler`] in state `Admitted`.  A failure
//!    here unregisters the modules already registered for the batch and
//!    revokes every grant, like a denial in step 4.
//!
//! Every rejection appends `ModuleRejected` to the audit log with a
//! structured reason.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use esta_types::{CapabilityId, EstaError, ModuleId, ModuleManifest, ProcessId};
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::authority::AuthorityTable;
use crate::capability::CapabilityEngine;
use crate::scheduler::Scheduler;
use crate::signature::{self, SignatureVerifier};

const AUDIT_SOURCE: &str = "loader";

type RuntimeCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// One module presented for admission.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub manifest: ModuleManifest,
    pub module_bytes: Vec<u8>,
    pub signature: Vec<u8>,
}

/// A module that passed admission.
#[derive(Debug, Clone, Serialize)]
pub struct AdmittedModule {
    pub id: ModuleId,
    pub pid: ProcessId,
    pub manifest: ModuleManifest,
    pub checksum: String,
    pub capabilities: Vec<CapabilityId>,
    #[serde(skip)]
    pub module_bytes: Arc<[u8]>,
}

/// Validates and admits modules.
pub struct ModuleRegistry {
    verifier: SignatureVerifier,
    authority: AuthorityTable,
    engine: Arc<CapabilityEngine>,
    scheduler: Arc<Mutex<Scheduler>>,
    audit: Arc<AuditLog>,
    runtime_supported: RuntimeCheck,
    modules: BTreeMap<ModuleId, AdmittedModule>,
    retired: Vec<AdmittedModule>,
    next_pid: u32,
}

impl ModuleRegistry {
    pub fn new(
        verifier: SignatureVerifier,
        authority: AuthorityTable,
        engine: Arc<CapabilityEngine>,
        scheduler: Arc<Mutex<Scheduler>>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            verifier,
            authority,
            engine,
            scheduler,
            audit,
            runtime_supported: Arc::new(|_| true),
            modules: BTreeMap::new(),
            retired: Vec::new(),
            next_pid: 1,
        }
    }

    /// Restrict admission to runtimes the host can instantiate.
    pub fn with_runtime_check(mut self, check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.runtime_supported = Arc::new(check);
        self
    }

    /// Reserve a pid outside module admission (drivers).
    pub fn allocate_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    pub fn authority(&self) -> &AuthorityTable {
        &self.authority
    }

    pub fn authority_mut(&mut self) -> &mut AuthorityTable {
        &mut self.authority
    }

    // ── admission ──────────────────────────────────────────────────────────

    /// Admit a single module.
    pub fn admit(&mut self, request: AdmissionRequest) -> Result<AdmittedModule, EstaError> {
        let mut admitted = self.admit_batch(vec![request])?;
        admitted.pop().ok_or_else(|| EstaError::InvalidManifest {
            module: String::new(),
            reason: "empty admission".into(),
        })
    }

    /// Admit modules that may depend on each other, all or nothing.
    ///
    /// Returns them in dependency order.
    pub fn admit_batch(
        &mut self,
        requests: Vec<AdmissionRequest>,
    ) -> Result<Vec<AdmittedModule>, EstaError> {
        for req in &requests {
            let name = &req.manifest.name;
            if let Err(err) = self
                .verifier
                .verify_module(name, &req.module_bytes, &req.signature)
            {
                return Err(self.reject(name, err));
            }
        }

        let mut checksums = Vec::with_capacity(requests.len());
        for (i, req) in requests.iter().enumerate() {
            let duplicate_in_batch = requests[..i]
                .iter()
                .any(|r| r.manifest.name == req.manifest.name);
            match self.validate_shape(req, duplicate_in_batch) {
                Ok(sum) => checksums.push(sum),
                Err(err) => return Err(self.reject(&req.manifest.name, err)),
            }
        }

        let manifests: Vec<&ModuleManifest> = requests.iter().map(|r| &r.manifest).collect();
        let order = match self.admission_order(&manifests) {
            Ok(order) => order,
            Err((module, err)) => return Err(self.reject(&module, err)),
        };

        let grants = self.grant_all(&requests, &order)?;

        let mut slots: Vec<Option<AdmissionRequest>> = requests.into_iter().map(Some).collect();
        let mut admitted = Vec::with_capacity(order.len());
        for (&i, (pid, caps)) in order.iter().zip(grants.iter().cloned()) {
            let Some(req) = slots[i].take() else { continue };
            let module = AdmittedModule {
                id: req.manifest.id(),
                pid,
                checksum: checksums[i].clone(),
                capabilities: caps,
                module_bytes: Arc::from(req.module_bytes),
                manifest: req.manifest,
            };
            if let Err(err) = self.register(&module) {
                self.unregister(&admitted);
                self.roll_back(&grants);
                return Err(self.reject(module.id.as_str(), err));
            }
            admitted.push(module);
        }
        Ok(admitted)
    }

    fn validate_shape(
        &self,
        req: &AdmissionRequest,
        duplicate_in_batch: bool,
    ) -> Result<String, EstaError> {
        let m = &req.manifest;
        let invalid = |reason: String| EstaError::InvalidManifest {
            module: m.name.clone(),
            reason,
        };

        if m.name.is_empty()
            || !m
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid(format!("invalid module name {:?}", m.name)));
        }
        if duplicate_in_batch || self.modules.contains_key(&m.id()) {
            return Err(EstaError::AlreadyAdmitted {
                module: m.name.clone(),
            });
        }
        semver::Version::parse(&m.version)
            .map_err(|e| invalid(format!("version {:?}: {e}", m.version)))?;
        if m.entry_point.trim().is_empty() {
            return Err(invalid("entry_point is empty".into()));
        }
        if m.runtime.trim().is_empty() {
            return Err(invalid("runtime is empty".into()));
        }
        if !(self.runtime_supported)(&m.runtime) {
            return Err(EstaError::UnsupportedRuntime(m.runtime.clone()));
        }

        let sum = signature::checksum(&req.module_bytes);
        if let Some(declared) = &m.checksum
            && !declared.eq_ignore_ascii_case(&sum)
        {
            return Err(invalid(format!("checksum mismatch: declared {declared}, actual {sum}")));
        }

        m.requested_capabilities().map_err(|e| invalid(e.to_string()))?;

        let limits = &m.resource_limits;
        if limits.max_execution_time_ms == 0 {
            return Err(invalid("max_execution_time_ms must be positive".into()));
        }
        if limits.max_queue_depth == 0 {
            return Err(invalid("max_queue_depth must be positive".into()));
        }
        if limits.max_concurrent_requests == 0 {
            return Err(invalid("max_concurrent_requests must be positive".into()));
        }
        if limits.max_memory == 0 {
            return Err(invalid("max_memory must be positive".into()));
        }
        if limits.cpu_quota_ms == Some(0) {
            return Err(invalid("cpu_quota_ms must be positive".into()));
        }
        Ok(sum)
    }

    /// Kahn's algorithm over the batch; dependencies outside the batch must
    /// already be admitted.
    fn admission_order(
        &self,
        batch: &[&ModuleManifest],
    ) -> Result<Vec<usize>, (String, EstaError)> {
        let index: HashMap<&str, usize> = batch
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.as_str(), i))
            .collect();
        let mut indegree = vec![0usize; batch.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); batch.len()];

        for (i, m) in batch.iter().enumerate() {
            for dep in &m.dependencies {
                if let Some(&j) = index.get(dep.as_str()) {
                    indegree[i] += 1;
                    dependents[j].push(i);
                } else if !self.modules.contains_key(&ModuleId::from(dep.as_str())) {
                    return Err((
                        m.name.clone(),
                        EstaError::UnresolvedDependency {
                            module: m.name.clone(),
                            dependency: dep.clone(),
                        },
                    ));
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..batch.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(batch.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        if order.len() < batch.len() {
            let mut modules: Vec<String> = (0..batch.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| batch[i].name.clone())
                .collect();
            modules.sort();
            return Err((modules.join(","), EstaError::DependencyCycle { modules }));
        }
        Ok(order)
    }

    /// Allocate pids and request capabilities in admission order, rolling
    /// everything back on the first denial.
    fn grant_all(
        &mut self,
        requests: &[AdmissionRequest],
        order: &[usize],
    ) -> Result<Vec<(ProcessId, Vec<CapabilityId>)>, EstaError> {
        let mut grants: Vec<(ProcessId, Vec<CapabilityId>)> = Vec::with_capacity(order.len());

        for &i in order {
            let manifest = &requests[i].manifest;
            let pid = self.allocate_pid();
            self.engine
                .bind_authority(pid, self.authority.entries_for(&manifest.name));
            grants.push((pid, Vec::new()));

            let wanted = match manifest.requested_capabilities() {
                Ok(wanted) => wanted,
                Err(err) => {
                    self.roll_back(&grants);
                    return Err(self.reject(&manifest.name, err));
                }
            };
            for req in wanted {
                match self.engine.request(req.resource, req.rights, pid) {
                    Ok(cap) => {
                        if let Some((_, caps)) = grants.last_mut() {
                            caps.push(cap.id);
                        }
                    }
                    Err(err) => {
                        self.roll_back(&grants);
                        return Err(self.reject(&manifest.name, err));
                    }
                }
            }
        }
        Ok(grants)
    }

    fn roll_back(&self, grants: &[(ProcessId, Vec<CapabilityId>)]) {
        for (pid, caps) in grants {
            for &cap in caps {
                if let Err(err) = self.engine.revoke(cap) {
                    warn!(%cap, error = %err, "rollback revoke failed");
                }
            }
            self.engine.unbind_authority(*pid);
        }
    }

    fn scheduler(&self) -> std::sync::MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leaves no scheduler record behind when it fails after registering.
    fn register(&mut self, module: &AdmittedModule) -> Result<(), EstaError> {
        {
            let mut sched = self.scheduler();
            sched.register(
                module.pid,
                module.id.clone(),
                module.manifest.priority.class(),
                module.manifest.resource_limits.clone(),
            )?;
            if let Err(err) =
                sched.attach_capabilities(module.pid, module.capabilities.iter().copied())
            {
                sched.forget(module.pid);
                return Err(err);
            }
        }
        if let Err(err) = self.audit.append(
            AuditEvent::ModuleAdmitted {
                module: module.id.to_string(),
                pid: module.pid,
                version: module.manifest.version.clone(),
                checksum: module.checksum.clone(),
            },
            AUDIT_SOURCE,
        ) {
            self.scheduler().forget(module.pid);
            return Err(err);
        }
        info!(
            module = %module.id,
            pid = %module.pid,
            version = %module.manifest.version,
            caps = module.capabilities.len(),
            "module admitted"
        );
        self.modules.insert(module.id.clone(), module.clone());
        Ok(())
    }

    /// Undo [`register`](Self::register) for modules of a failed batch.
    fn unregister(&mut self, modules: &[AdmittedModule]) {
        for module in modules {
            self.modules.remove(&module.id);
            if self.scheduler().forget(module.pid).is_none() {
                warn!(pid = %module.pid, "rollback found no scheduler record");
            }
        }
    }

    fn reject(&self, module: &str, err: EstaError) -> EstaError {
        warn!(module, error = %err, "admission rejected");
        if let Err(audit_err) = self.audit.append(
            AuditEvent::ModuleRejected {
                module: module.to_string(),
                reason: err.to_string(),
            },
            AUDIT_SOURCE,
        ) {
            warn!(error = %audit_err, "audit append failed");
        }
        err
    }

    // ── lifecycle ──────────────────────────────────────────────────────────

    /// Move a terminated module out of the live set so a new version can be
    /// admitted under the same name.
    pub fn retire(&mut self, pid: ProcessId) -> Option<AdmittedModule> {
        let id = self.modules.values().find(|m| m.pid == pid)?.id.clone();
        let module = self.modules.remove(&id)?;
        self.engine.unbind_authority(pid);
        self.retired.push(module.clone());
        Some(module)
    }

    // ── queries ────────────────────────────────────────────────────────────

    pub fn get(&self, id: &ModuleId) -> Option<&AdmittedModule> {
        self.modules.get(id)
    }

    pub fn by_pid(&self, pid: ProcessId) -> Option<&AdmittedModule> {
        self.modules.values().find(|m| m.pid == pid)
    }

    pub fn modules(&self) -> impl Iterator<Item = &AdmittedModule> {
        self.modules.values()
    }

    pub fn retired(&self) -> &[AdmittedModule] {
        &self.retired
    }
}
