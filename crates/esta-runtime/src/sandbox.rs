//! The contract between the kernel and a module's isolated execution
//! environment.
//!
//! A [`ModuleInstance`] runs one bounded slice at a time and reports how much
//! of it was consumed.  It can touch the outside world only through its
//! [`SliceContext`], whose sends are always stamped with the instance's own
//! pid and go through the router's capability check.  Concrete runtimes
//! register a [`ModuleFactory`] under their runtime string with
//! [`Runtimes`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use esta_ipc::{Router, SendReceipt};
use esta_kernel::{AdmittedModule, Clock, SliceOutcome};
use esta_types::{EstaError, Message, MessageFlags, MessageKind, Priority, ProcessId};

/// What a runner hands back when the slice ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceReport {
    /// Metered execution time; the scheduler clamps it to the slice.
    pub used_ms: u64,
    pub outcome: SliceOutcome,
}

impl SliceReport {
    pub fn new(used_ms: u64, outcome: SliceOutcome) -> Self {
        Self { used_ms, outcome }
    }
}

/// A module's view of the kernel for the duration of one slice.
pub struct SliceContext {
    pid: ProcessId,
    slice: Duration,
    router: Arc<Router>,
    clock: Arc<dyn Clock>,
    memory_limit: u64,
    received: usize,
    sent: Vec<SendReceipt>,
}

impl SliceContext {
    pub fn new(pid: ProcessId, slice: Duration, router: Arc<Router>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pid,
            slice,
            router,
            clock,
            memory_limit: u64::MAX,
            received: 0,
            sent: Vec::new(),
        }
    }

    /// Cap the instance's linear memory at `bytes`.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Linear memory ceiling in bytes.
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    /// Check a memory footprint of `bytes` before the instance grows to it.
    pub fn ensure_memory(&self, bytes: u64) -> Result<(), EstaError> {
        if bytes > self.memory_limit {
            return Err(EstaError::QuotaExceeded { pid: self.pid });
        }
        Ok(())
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Slice length granted by the scheduler.
    pub fn slice(&self) -> Duration {
        self.slice
    }

    pub fn slice_ms(&self) -> u64 {
        u64::try_from(self.slice.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Take the next message from this module's mailbox.
    pub fn recv(&mut self) -> Result<Option<Message>, EstaError> {
        let msg = self.router.receive(self.pid)?;
        if msg.is_some() {
            self.received += 1;
        }
        Ok(msg)
    }

    /// Send `payload` to `target`.  The source is always this module.
    pub fn send(
        &mut self,
        target: ProcessId,
        priority: Priority,
        payload: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<SendReceipt, EstaError> {
        let msg = Message::new(self.pid, target, priority, payload).with_flags(flags);
        let receipt = self.router.send(msg)?;
        self.sent.push(receipt);
        Ok(receipt)
    }

    /// Answer `request` with a typed reply at the request's priority.
    pub fn reply(
        &mut self,
        request: &Message,
        kind: MessageKind,
        body: &[u8],
    ) -> Result<SendReceipt, EstaError> {
        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(kind.code());
        payload.extend_from_slice(body);
        self.send(request.source, request.priority, payload, MessageFlags::REPLY)
    }

    /// Resolve a mailbox name such as `driver.clock` to its pid.
    pub fn lookup(&self, name: &str) -> Option<ProcessId> {
        self.router.lookup(name)
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn sent(&self) -> &[SendReceipt] {
        &self.sent
    }
}

/// One running module.
pub trait ModuleInstance: Send {
    /// Run until the slice is used up, the module blocks, or it exits.
    fn run_slice(&mut self, ctx: &mut SliceContext) -> SliceReport;
}

/// Builds instances for one runtime string.
pub trait ModuleFactory: Send + Sync {
    fn instantiate(&self, module: &AdmittedModule) -> Result<Box<dyn ModuleInstance>, EstaError>;
}

/// Registered factories keyed by runtime string.  Cheap to clone.
#[derive(Clone, Default)]
pub struct Runtimes {
    factories: Arc<RwLock<HashMap<String, Arc<dyn ModuleFactory>>>>,
}

impl Runtimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, runtime: &str, factory: Arc<dyn ModuleFactory>) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(runtime.to_string(), factory);
    }

    pub fn supports(&self, runtime: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(runtime)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn instantiate(&self, module: &AdmittedModule) -> Result<Box<dyn ModuleInstance>, EstaError> {
        let runtime = &module.manifest.runtime;
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(runtime)
            .cloned()
            .ok_or_else(|| EstaError::UnsupportedRuntime(runtime.clone()))?;
        factory.instantiate(module)
    }
}

impl std::fmt::Debug for Runtimes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtimes").field("runtimes", &self.names()).finish()
    }
}
