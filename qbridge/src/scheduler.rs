//! Adaptive cycle cadence.
//!
//! The scheduler decides the delay before the next planning cycle. The
//! hard cap exists to satisfy failover timing and applies in every
//! state; degraded conditions shorten the delay, never lengthen it.

use std::time::Duration;

use crate::config::{CadenceConfig, GuardConfig};
use crate::guard::GuardState;

/// Upper bound on the cycle delay in every state (failover timing).
pub const CYCLE_DELAY_CAP_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct CycleScheduler {
    base: Duration,
    scintillation_threshold: f64,
}

impl CycleScheduler {
    pub fn new(cadence: &CadenceConfig, guard: &GuardConfig) -> Self {
        Self {
            base: cadence.cycle_period().min(Duration::from_millis(CYCLE_DELAY_CAP_MS)),
            scintillation_threshold: guard.scintillation_threshold,
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before the next cycle.
    ///
    /// A planner hint may stretch the delay up to the cap while the link
    /// is healthy. Under degradation (state or scintillation) the delay
    /// is half the base cadence regardless of any hint. Halted ignores
    /// hints entirely: the loop only re-samples telemetry for recovery
    /// detection. No state produces a delay below half the base; the
    /// RPC deadline is validated against that floor.
    pub fn next_delay(
        &self,
        state: GuardState,
        scintillation_idx: f64,
        planner_hint_ms: Option<u64>,
    ) -> Duration {
        let cap = Duration::from_millis(CYCLE_DELAY_CAP_MS);

        if state.is_halted() {
            return self.base.min(cap);
        }

        if state == GuardState::Degraded || scintillation_idx > self.scintillation_threshold {
            return (self.base / 2).min(cap);
        }

        let delay = match planner_hint_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(cap),
            _ => self.base,
        };
        delay.max(self.base / 2)
    }
}
