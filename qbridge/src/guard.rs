//! QBER guard-band monitor.
//!
//! Classifies each incoming QBER sample into one of four bands and
//! derives the bridge state from it. The hard ceiling comes from
//! `SafetyLimits`; the lower band boundaries are fixed. Only the cycle
//! loop feeds this state machine, so it needs no synchronization.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{GuardConfig, SafetyLimits};

/// Boundary between the nominal and investigate bands (QBER pct).
pub const INVESTIGATE_BAND_PCT: f64 = 3.0;
/// Boundary between the investigate and degraded bands (QBER pct).
pub const DEGRADED_BAND_PCT: f64 = 5.0;

/// Operational state of the bridge, derived solely from QBER.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardState {
    #[default]
    Nominal,
    Investigate,
    /// Key release throttled; enhanced finite-key estimation requested.
    Degraded,
    /// Shutter parked, planning suppressed until recovery.
    Halted,
}

impl GuardState {
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Halted)
    }
}

/// Pure band lookup for a single sample against a given ceiling.
pub fn classify(qber_pct: f64, ceiling_pct: f64) -> GuardState {
    if qber_pct <= INVESTIGATE_BAND_PCT {
        GuardState::Nominal
    } else if qber_pct <= DEGRADED_BAND_PCT {
        GuardState::Investigate
    } else if qber_pct <= ceiling_pct {
        GuardState::Degraded
    } else {
        GuardState::Halted
    }
}

/// A completed state transition, surfaced to the alert channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardTransition {
    pub from: GuardState,
    pub to: GuardState,
    pub qber_pct: f64,
}

/// Stateful monitor applying the band table plus halt hysteresis.
///
/// Every transition except the Halted exit is a pure function of the
/// latest sample. Leaving Halted requires `recovery_samples` consecutive
/// readings at or below `recovery_threshold_pct`; any sample above the
/// threshold resets the streak.
#[derive(Debug)]
pub struct GuardMonitor {
    ceiling_pct: f64,
    recovery_threshold_pct: f64,
    recovery_samples: u32,
    state: GuardState,
    recovery_streak: u32,
    halt_episode: Option<Uuid>,
}

impl GuardMonitor {
    pub fn new(limits: &SafetyLimits, guard: &GuardConfig) -> Self {
        Self {
            ceiling_pct: limits.qber_hard_ceiling_pct,
            recovery_threshold_pct: guard.recovery_threshold_pct,
            recovery_samples: guard.recovery_samples,
            state: GuardState::Nominal,
            recovery_streak: 0,
            halt_episode: None,
        }
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    /// Identifier of the current halt episode, if any. Stable for the
    /// whole episode so shutter retries and alerts can be correlated.
    pub fn halt_episode(&self) -> Option<Uuid> {
        self.halt_episode
    }

    /// Feed one QBER sample; returns the transition if the state changed.
    pub fn observe(&mut self, qber_pct: f64) -> Option<GuardTransition> {
        let from = self.state;
        let band = classify(qber_pct, self.ceiling_pct);

        let to = if from.is_halted() && !band.is_halted() {
            if qber_pct <= self.recovery_threshold_pct {
                self.recovery_streak += 1;
            } else {
                self.recovery_streak = 0;
            }
            if self.recovery_streak >= self.recovery_samples {
                self.recovery_streak = 0;
                self.halt_episode = None;
                band
            } else {
                GuardState::Halted
            }
        } else {
            if band.is_halted() {
                if !from.is_halted() {
                    self.halt_episode = Some(Uuid::new_v4());
                }
                self.recovery_streak = 0;
            }
            band
        };

        self.state = to;
        (from != to).then_some(GuardTransition { from, to, qber_pct })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> GuardMonitor {
        GuardMonitor::new(&SafetyLimits::default(), &GuardConfig::default())
    }

    #[test]
    fn band_table_matches_published_boundaries() {
        assert_eq!(classify(0.0, 11.0), GuardState::Nominal);
        assert_eq!(classify(3.0, 11.0), GuardState::Nominal);
        assert_eq!(classify(3.01, 11.0), GuardState::Investigate);
        assert_eq!(classify(5.0, 11.0), GuardState::Investigate);
        assert_eq!(classify(5.01, 11.0), GuardState::Degraded);
        assert_eq!(classify(11.0, 11.0), GuardState::Degraded);
        assert_eq!(classify(11.01, 11.0), GuardState::Halted);
    }

    #[test]
    fn tightened_ceiling_narrows_the_degraded_band() {
        let limits = SafetyLimits {
            qber_hard_ceiling_pct: 8.0,
            ..SafetyLimits::default()
        };
        let mut m = GuardMonitor::new(&limits, &GuardConfig::default());
        m.observe(9.0);
        assert_eq!(m.state(), GuardState::Halted);
    }

    #[test]
    fn reference_qber_sequence() {
        let mut m = monitor();
        let expected = [
            GuardState::Nominal,
            GuardState::Investigate,
            GuardState::Degraded,
            GuardState::Halted,
            GuardState::Halted,
            GuardState::Halted,
            GuardState::Nominal,
        ];
        let observed: Vec<GuardState> = [2.0, 4.0, 6.0, 12.0, 9.0, 2.0, 2.0]
            .iter()
            .map(|&q| {
                m.observe(q);
                m.state()
            })
            .collect();
        assert_eq!(observed, expected);
    }

    #[test]
    fn sample_above_recovery_threshold_resets_the_streak() {
        let mut m = monitor();
        m.observe(12.0);
        m.observe(2.0); // streak 1
        m.observe(7.0); // in degraded band but above threshold: reset
        m.observe(2.0); // streak 1 again
        assert_eq!(m.state(), GuardState::Halted);
        m.observe(2.0); // streak 2: recovered
        assert_eq!(m.state(), GuardState::Nominal);
    }

    #[test]
    fn recovery_lands_on_the_band_of_the_final_sample() {
        let mut m = monitor();
        m.observe(12.0);
        m.observe(4.0);
        m.observe(4.0);
        assert_eq!(m.state(), GuardState::Investigate);
    }

    #[test]
    fn halt_episode_is_stable_until_recovery() {
        let mut m = monitor();
        assert!(m.halt_episode().is_none());
        m.observe(12.0);
        let episode = m.halt_episode().expect("episode id on halt");
        m.observe(13.0);
        assert_eq!(m.halt_episode(), Some(episode));
        m.observe(2.0);
        m.observe(2.0);
        assert!(m.halt_episode().is_none());

        // A fresh breach opens a new episode.
        m.observe(12.0);
        assert_ne!(m.halt_episode(), Some(episode));
    }

    #[test]
    fn re_breach_during_recovery_stays_in_the_same_episode() {
        let mut m = monitor();
        m.observe(12.0);
        let episode = m.halt_episode();
        m.observe(2.0);
        m.observe(14.0); // back over the ceiling mid-recovery
        assert_eq!(m.state(), GuardState::Halted);
        assert_eq!(m.halt_episode(), episode);
    }

    #[test]
    fn transitions_are_reported_once() {
        let mut m = monitor();
        assert!(m.observe(2.0).is_none());
        let t = m.observe(4.0).expect("transition to investigate");
        assert_eq!(t.from, GuardState::Nominal);
        assert_eq!(t.to, GuardState::Investigate);
        assert!(m.observe(4.5).is_none());
    }
}
