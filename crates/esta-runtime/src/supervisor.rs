//! [`Supervisor`] – restart policy for terminated modules.
//!
//! The supervisor only decides.  A restart is carried out by the kernel as a
//! fresh admission of the module's stored signed bundle, so a restarted
//! module goes through signature, manifest and capability checks again.
//!
//! # Algorithm
//!
//! Each module keeps the timestamps of its recent restarts.  On termination
//! the strategy decides whether the exit warrants a restart at all; if it
//! does, restarts older than `window_ms` are forgotten and the module gives
//! up once `max_restarts` remain inside the window.  Otherwise the restart is
//! delayed by `base_backoff_ms · 2^(attempt-1)`, capped at `max_backoff_ms`.
//!
//! Quota exhaustion, revocation and shutdown are never restarted.
//!
//! # Example
//!
//! ```rust
//! use esta_kernel::TerminationReason;
//! use esta_runtime::supervisor::{RestartPolicy, Supervisor, SupervisorDecision};
//! use esta_types::ModuleId;
//!
//! let mut sup = Supervisor::new(RestartPolicy::default());
//! let echo = ModuleId("echo".into());
//!
//! let trap = TerminationReason::Trapped("oob".into());
//! assert!(matches!(sup.on_termination(&echo, &trap, 0), SupervisorDecision::Restart { attempt: 1, .. }));
//! assert_eq!(sup.on_termination(&echo, &TerminationReason::QuotaExceeded, 0), SupervisorDecision::Ignore);
//! ```

use std::collections::{HashMap, VecDeque};

use esta_kernel::TerminationReason;
use esta_types::ModuleId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Which exits deserve a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    /// Restart after any exit or trap.
    Permanent,
    /// Restart only after a trap.
    #[default]
    Transient,
    /// Never restart.
    Temporary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub strategy: RestartStrategy,
    /// Restarts tolerated inside `window_ms` before giving up.
    pub max_restarts: u32,
    pub window_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            strategy: RestartStrategy::Transient,
            max_restarts: 3,
            window_ms: 60_000,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RestartPolicy {
    fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(32);
        self.base_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorDecision {
    /// Re-admit after `after_ms`.
    Restart { after_ms: u64, attempt: u32 },
    /// The exit does not call for a restart.
    Ignore,
    /// Restart intensity exceeded; leave the module down.
    GiveUp,
}

pub struct Supervisor {
    default_policy: RestartPolicy,
    policies: HashMap<ModuleId, RestartPolicy>,
    history: HashMap<ModuleId, VecDeque<u64>>,
}

impl Supervisor {
    pub fn new(default_policy: RestartPolicy) -> Self {
        Self {
            default_policy,
            policies: HashMap::new(),
            history: HashMap::new(),
        }
    }

    pub fn set_policy(&mut self, module: ModuleId, policy: RestartPolicy) {
        self.policies.insert(module, policy);
    }

    pub fn policy(&self, module: &ModuleId) -> &RestartPolicy {
        self.policies.get(module).unwrap_or(&self.default_policy)
    }

    /// Decide what to do about `module` terminating with `reason` at `now_ms`.
    pub fn on_termination(
        &mut self,
        module: &ModuleId,
        reason: &TerminationReason,
        now_ms: u64,
    ) -> SupervisorDecision {
        let policy = self.policy(module).clone();
        let wanted = match reason {
            TerminationReason::QuotaExceeded
            | TerminationReason::Revoked
            | TerminationReason::Shutdown => false,
            TerminationReason::Exited => policy.strategy == RestartStrategy::Permanent,
            TerminationReason::Trapped(_) => policy.strategy != RestartStrategy::Temporary,
        };
        if !wanted {
            return SupervisorDecision::Ignore;
        }

        let history = self.history.entry(module.clone()).or_default();
        while history
            .front()
            .is_some_and(|&t| now_ms.saturating_sub(t) >= policy.window_ms)
        {
            history.pop_front();
        }
        if history.len() >= policy.max_restarts as usize {
            warn!(%module, restarts = history.len(), window_ms = policy.window_ms, "restart intensity exceeded, giving up");
            return SupervisorDecision::GiveUp;
        }
        history.push_back(now_ms);

        let attempt = u32::try_from(history.len()).unwrap_or(u32::MAX);
        let after_ms = policy.backoff_ms(attempt);
        info!(%module, %reason, attempt, after_ms, "restart scheduled");
        SupervisorDecision::Restart { after_ms, attempt }
    }

    /// Forget the restart history of `module`.
    pub fn reset(&mut self, module: &ModuleId) {
        self.history.remove(module);
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(RestartPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> ModuleId {
        ModuleId("worker".into())
    }

    fn trap() -> TerminationReason {
        TerminationReason::Trapped("unreachable".into())
    }

    #[test]
    fn strategies_filter_exit_kinds() {
        let mut sup = Supervisor::default();
        assert_eq!(sup.on_termination(&module(), &TerminationReason::Exited, 0), SupervisorDecision::Ignore);

        sup.set_policy(module(), RestartPolicy { strategy: RestartStrategy::Permanent, ..Default::default() });
        assert!(matches!(
            sup.on_termination(&module(), &TerminationReason::Exited, 0),
            SupervisorDecision::Restart { .. }
        ));

        sup.set_policy(module(), RestartPolicy { strategy: RestartStrategy::Temporary, ..Default::default() });
        assert_eq!(sup.on_termination(&module(), &trap(), 0), SupervisorDecision::Ignore);
    }

    #[test]
    fn quota_revocation_and_shutdown_are_final() {
        let mut sup = Supervisor::new(RestartPolicy {
            strategy: RestartStrategy::Permanent,
            ..Default::default()
        });
        for reason in [
            TerminationReason::QuotaExceeded,
            TerminationReason::Revoked,
            TerminationReason::Shutdown,
        ] {
            assert_eq!(sup.on_termination(&module(), &reason, 0), SupervisorDecision::Ignore);
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut sup = Supervisor::new(RestartPolicy {
            max_restarts: 10,
            base_backoff_ms: 100,
            max_backoff_ms: 350,
            ..Default::default()
        });
        let delays: Vec<u64> = (0..4)
            .map(|_| match sup.on_termination(&module(), &trap(), 0) {
                SupervisorDecision::Restart { after_ms, .. } => after_ms,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
    }

    #[test]
    fn intensity_window_gives_up_then_recovers() {
        let mut sup = Supervisor::new(RestartPolicy {
            max_restarts: 2,
            window_ms: 1_000,
            ..Default::default()
        });
        assert!(matches!(sup.on_termination(&module(), &trap(), 0), SupervisorDecision::Restart { attempt: 1, .. }));
        assert!(matches!(sup.on_termination(&module(), &trap(), 10), SupervisorDecision::Restart { attempt: 2, .. }));
        assert_eq!(sup.on_termination(&module(), &trap(), 20), SupervisorDecision::GiveUp);

        // Both earlier restarts have aged out of the window.
        assert!(matches!(sup.on_termination(&module(), &trap(), 1_500), SupervisorDecision::Restart { attempt: 1, .. }));

        sup.reset(&module());
        assert!(matches!(sup.on_termination(&module(), &trap(), 1_600), SupervisorDecision::Restart { attempt: 1, .. }));
    }
}
