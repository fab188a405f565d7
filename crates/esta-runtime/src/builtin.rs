//! Native modules shipped with the kernel.
//!
//! | Runtime | Behaviour |
//! |---|---|
//! | `builtin:echo` | Answers `Ping` with `Pong` carrying the same body. |
//! | `builtin:spin` | Burns its whole slice every time it runs. |
//!
//! Both exit on `SystemShutdown`.  Each handled message is metered at
//! [`MESSAGE_COST_MS`].

use std::sync::Arc;

use esta_kernel::{AdmittedModule, SliceOutcome};
use esta_types::{EstaError, MessageKind};
use tracing::{debug, warn};

use crate::sandbox::{ModuleFactory, ModuleInstance, Runtimes, SliceContext, SliceReport};

pub const ECHO_RUNTIME: &str = "builtin:echo";
pub const SPIN_RUNTIME: &str = "builtin:spin";

/// Metered cost of handling one message.
pub const MESSAGE_COST_MS: u64 = 1;

/// Register every builtin factory.
pub fn register_builtins(runtimes: &Runtimes) {
    runtimes.register(ECHO_RUNTIME, Arc::new(EchoFactory));
    runtimes.register(SPIN_RUNTIME, Arc::new(SpinFactory));
}

// ── echo ────────────────────────────────────────────────────────────────────

struct EchoFactory;

impl ModuleFactory for EchoFactory {
    fn instantiate(&self, module: &AdmittedModule) -> Result<Box<dyn ModuleInstance>, EstaError> {
        debug!(module = %module.id, "echo instance created");
        Ok(Box::new(Echo { answered: 0 }))
    }
}

#[derive(Debug)]
pub struct Echo {
    answered: u64,
}

impl ModuleInstance for Echo {
    fn run_slice(&mut self, ctx: &mut SliceContext) -> SliceReport {
        let budget = ctx.slice_ms();
        let mut used = 0;
        while used < budget {
            let msg = match ctx.recv() {
                Ok(Some(msg)) => msg,
                Ok(None) => return SliceReport::new(used, SliceOutcome::WaitMessage),
                Err(err) => return SliceReport::new(used, SliceOutcome::Trapped(err.to_string())),
            };
            used += MESSAGE_COST_MS;
            match msg.kind() {
                Some(MessageKind::Ping) => {
                    let body = msg.body().to_vec();
                    match ctx.reply(&msg, MessageKind::Pong, &body) {
                        Ok(_) => self.answered += 1,
                        Err(err) => warn!(pid = %ctx.pid(), to = %msg.source, %err, "echo reply refused"),
                    }
                }
                Some(MessageKind::SystemShutdown) => {
                    return SliceReport::new(used, SliceOutcome::Exited);
                }
                _ => {}
            }
        }
        SliceReport::new(used, SliceOutcome::Preempted)
    }
}

// ── spin ────────────────────────────────────────────────────────────────────

struct SpinFactory;

impl ModuleFactory for SpinFactory {
    fn instantiate(&self, _module: &AdmittedModule) -> Result<Box<dyn ModuleInstance>, EstaError> {
        Ok(Box::new(Spin))
    }
}

#[derive(Debug)]
pub struct Spin;

impl ModuleInstance for Spin {
    fn run_slice(&mut self, ctx: &mut SliceContext) -> SliceReport {
        while let Ok(Some(msg)) = ctx.recv() {
            if msg.kind() == Some(MessageKind::SystemShutdown) {
                return SliceReport::new(MESSAGE_COST_MS, SliceOutcome::Exited);
            }
        }
        SliceReport::new(ctx.slice_ms(), SliceOutcome::Preempted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let runtimes = Runtimes::new();
        register_builtins(&runtimes);
        assert!(runtimes.supports(ECHO_RUNTIME));
        assert!(runtimes.supports(SPIN_RUNTIME));
        assert!(!runtimes.supports("wasm"));
        assert_eq!(runtimes.names(), vec![ECHO_RUNTIME, SPIN_RUNTIME]);
    }
}
