//! Safety clamp for planner proposals.
//!
//! Pure functions: every scalar field of a proposed override tuple is
//! independently bounded to its configured interval, the decoy
//! probability triple is renormalized to sum to 1, and domain-policy
//! fields pass through untouched. Out-of-range input degrades silently
//! to a bounded value; the `was_modified` flag lets the caller log it.

use crate::config::SafetyLimits;
use crate::protocol::{DecoyProfile, PhaseOverrides, PlanResponse, TxOverrides};

fn clamp_scalar(value: f64, lo: f64, hi: f64, modified: &mut bool) -> f64 {
    let bounded = value.clamp(lo, hi);
    if bounded != value {
        *modified = true;
    }
    bounded
}

fn clamp_decoys(decoys: &DecoyProfile, limits: &SafetyLimits, modified: &mut bool) -> DecoyProfile {
    let (mu_min, mu_max) = limits.mu_range;
    let mut out = DecoyProfile {
        mu_signal: clamp_scalar(decoys.mu_signal, mu_min, mu_max, modified),
        mu_decoy: clamp_scalar(decoys.mu_decoy, mu_min, mu_max, modified),
        vac_prob: clamp_scalar(decoys.vac_prob, 0.0, 1.0, modified),
        sig_prob: clamp_scalar(decoys.sig_prob, 0.0, 1.0, modified),
        decoy_prob: clamp_scalar(decoys.decoy_prob, 0.0, 1.0, modified),
    };

    let sum = out.vac_prob + out.sig_prob + out.decoy_prob;
    if sum <= 0.0 {
        // Degenerate triple: keep a usable all-signal profile.
        out.vac_prob = 0.0;
        out.sig_prob = 1.0;
        out.decoy_prob = 0.0;
        *modified = true;
    } else if (sum - 1.0).abs() > 1e-9 {
        out.vac_prob /= sum;
        out.sig_prob /= sum;
        out.decoy_prob /= sum;
        *modified = true;
    }
    out
}

fn clamp_tx(tx: &TxOverrides, limits: &SafetyLimits, modified: &mut bool) -> TxOverrides {
    let (rep_min, rep_max) = limits.rep_rate_hz_range;
    TxOverrides {
        rep_rate_hz: clamp_scalar(tx.rep_rate_hz, rep_min, rep_max, modified),
        pulse_width_ps: clamp_scalar(tx.pulse_width_ps, 0.0, f64::INFINITY, modified),
        decoys: tx.decoys.as_ref().map(|d| clamp_decoys(d, limits, modified)),
        gate_shift_ps: tx.gate_shift_ps,
    }
}

fn clamp_phase(
    phase: &PhaseOverrides,
    limits: &SafetyLimits,
    modified: &mut bool,
) -> PhaseOverrides {
    let limit = limits.amzi_phase_deg_limit;
    PhaseOverrides {
        amzi_phase_deg: clamp_scalar(phase.amzi_phase_deg, -limit, limit, modified),
        eom_bias_v_delta: phase.eom_bias_v_delta,
    }
}

/// Bound a proposed override tuple against the safety envelope.
///
/// Never fails; clamping is idempotent. The second return value is true
/// when any field was altered.
pub fn clamp_overrides(proposed: &PlanResponse, limits: &SafetyLimits) -> (PlanResponse, bool) {
    let mut modified = false;
    let clamped = PlanResponse {
        tx: proposed.tx.as_ref().map(|tx| clamp_tx(tx, limits, &mut modified)),
        phase: proposed
            .phase
            .as_ref()
            .map(|p| clamp_phase(p, limits, &mut modified)),
        // Advisory, not safety-bearing: passed through unmodified.
        domain: proposed.domain.clone(),
        next_cycle_ms: proposed.next_cycle_ms,
        rationale: proposed.rationale.clone(),
    };
    (clamped, modified)
}
