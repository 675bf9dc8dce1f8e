//! Wire types for the dcq.v1 planning contract.
//!
//! Field names are normative: the planner side of the contract is an
//! external process, so renaming anything here is a breaking change.
//! Telemetry flows controller -> bridge -> planner; plan responses flow
//! planner -> bridge and are clamped before any of them reach hardware.

use serde::{Deserialize, Serialize};

/// Physical backhaul bearer a traffic flow can be steered onto.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Domain {
    #[default]
    #[serde(rename = "FSO")]
    Fso,
    #[serde(rename = "MMWAVE")]
    MmWave,
    #[serde(rename = "LEO")]
    Leo,
    #[serde(rename = "WIFI7")]
    Wifi7,
    #[serde(rename = "FR3_6G")]
    Fr3,
}

/// Traffic priority tier driving the DSCP/steering mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SloClass {
    #[default]
    Urllc,
    Embb,
    BestEffort,
}

/// Point-in-time link telemetry. Produced by the controller, never
/// mutated after capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub t_unix_ms: i64,
    pub qber_pct: f64,
    pub sifted_rate_cps: f64,
    pub secure_rate_bps: f64,
    pub jitter_ps: f64,
    pub atm_loss_db_per_km: f64,
    pub dark_cps: f64,
    pub det_eff: f64,
    pub temperature_c: f64,
    pub site: String,
    pub active_domain: Domain,
    pub scintillation_idx: f64,
}

/// Shared drift model pushed to both peers so they plan against the
/// same clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockModel {
    pub coarse_ppb: f64,
    pub fine_hz: f64,
    pub tdc_bin_ps: f64,
    pub gate_ns: f64,
}

impl Default for ClockModel {
    fn default() -> Self {
        Self {
            coarse_ppb: 0.0,
            fine_hz: 0.0,
            tdc_bin_ps: 10.0,
            gate_ns: 1.0,
        }
    }
}

/// Safety envelope projection sent to the planner. Informs proposals;
/// the bridge still clamps everything that comes back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub mu_min: f64,
    pub mu_max: f64,
    pub rep_rate_min_hz: f64,
    pub rep_rate_max_hz: f64,
    pub qber_hard_ceiling_pct: f64,
}

/// Service-level objective for the active traffic class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Slo {
    pub cls: SloClass,
    pub jitter_ps_target: f64,
    pub key_rate_min_bps: f64,
}

/// Decoy-state intensity levels and selection probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecoyProfile {
    pub mu_signal: f64,
    pub mu_decoy: f64,
    pub vac_prob: f64,
    pub sig_prob: f64,
    pub decoy_prob: f64,
}

/// Proposed transmit-side adjustments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOverrides {
    pub rep_rate_hz: f64,
    pub pulse_width_ps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoys: Option<DecoyProfile>,
    pub gate_shift_ps: f64,
}

/// Proposed interferometer trims.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverrides {
    pub amzi_phase_deg: f64,
    pub eom_bias_v_delta: f64,
}

/// Advisory domain steering hint. Not safety-bearing; passed through
/// the clamp unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainPolicy {
    pub preferred: Domain,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srv6_bsid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dscp: Option<u8>,
    #[serde(default)]
    pub mlo_prefer_6ghz: bool,
}

/// One planning round-trip: everything the planner needs to propose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub clock: ClockModel,
    pub tel: Telemetry,
    pub limits: Constraints,
    pub slo: Slo,
}

/// The planner's proposal for the next cycle. Untrusted input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<TxOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainPolicy>,
    #[serde(default)]
    pub next_cycle_ms: u64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub plugin_name: String,
    pub version: String,
    pub git_sha: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub bridge_version: String,
    pub qcs_firmware: String,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_plan_tx_schedule: bool,
    pub can_phase_dither: bool,
    pub can_clock_align: bool,
    pub can_domain_policy: bool,
    pub requires_raw_counts: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default)]
    pub msg: String,
}
