//! Bridge configuration.
//!
//! Loaded once at startup from a TOML document and validated before the
//! cycle loop starts. A bound with `min > max` or a non-positive cadence
//! is a startup error, never a runtime one. `SafetyLimits` is immutable
//! after load and passed by reference into every component that needs it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{Constraints, Slo, SloClass};

/// Published default for the QBER hard ceiling. A deployment may tighten
/// the ceiling freely but loosening it past this value requires the
/// explicit `allow_ceiling_override` flag.
pub const QBER_CEILING_DEFAULT_PCT: f64 = 11.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Hardware safety envelope. Every override the planner proposes is
/// clamped against these bounds before it reaches the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub mu_range: (f64, f64),
    pub rep_rate_hz_range: (f64, f64),
    pub amzi_phase_deg_limit: f64,
    pub qber_hard_ceiling_pct: f64,
    pub shutter_guard: bool,
    /// Required to raise the ceiling past [`QBER_CEILING_DEFAULT_PCT`].
    #[serde(default)]
    pub allow_ceiling_override: bool,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            mu_range: (0.05, 0.8),
            rep_rate_hz_range: (1.0e6, 1.0e9),
            amzi_phase_deg_limit: 15.0,
            qber_hard_ceiling_pct: QBER_CEILING_DEFAULT_PCT,
            shutter_guard: true,
            allow_ceiling_override: false,
        }
    }
}

impl SafetyLimits {
    /// Projection sent to the planner so its proposals are informed.
    pub fn constraints(&self) -> Constraints {
        Constraints {
            mu_min: self.mu_range.0,
            mu_max: self.mu_range.1,
            rep_rate_min_hz: self.rep_rate_hz_range.0,
            rep_rate_max_hz: self.rep_rate_hz_range.1,
            qber_hard_ceiling_pct: self.qber_hard_ceiling_pct,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mu_range.0 > self.mu_range.1 {
            return Err(ConfigError::invalid(format!(
                "mu_range min {} exceeds max {}",
                self.mu_range.0, self.mu_range.1
            )));
        }
        if self.mu_range.0 < 0.0 {
            return Err(ConfigError::invalid("mu_range must be non-negative"));
        }
        if self.rep_rate_hz_range.0 > self.rep_rate_hz_range.1 {
            return Err(ConfigError::invalid(format!(
                "rep_rate_hz_range min {} exceeds max {}",
                self.rep_rate_hz_range.0, self.rep_rate_hz_range.1
            )));
        }
        if self.rep_rate_hz_range.0 <= 0.0 {
            return Err(ConfigError::invalid("rep_rate_hz_range must be positive"));
        }
        if self.amzi_phase_deg_limit < 0.0 {
            return Err(ConfigError::invalid("amzi_phase_deg_limit must be >= 0"));
        }
        if self.qber_hard_ceiling_pct <= 0.0 {
            return Err(ConfigError::invalid("qber_hard_ceiling_pct must be positive"));
        }
        if self.qber_hard_ceiling_pct > QBER_CEILING_DEFAULT_PCT && !self.allow_ceiling_override {
            return Err(ConfigError::invalid(format!(
                "qber_hard_ceiling_pct {} exceeds the published default {}; \
                 set allow_ceiling_override to loosen it",
                self.qber_hard_ceiling_pct, QBER_CEILING_DEFAULT_PCT
            )));
        }
        Ok(())
    }
}

/// Loop cadences, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    pub cycle_period_ms: u64,
    pub telemetry_period_ms: u64,
    /// Deadline for each outbound RPC. Must be short enough that a hung
    /// peer never stalls the loop past one cycle.
    pub rpc_timeout_ms: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            cycle_period_ms: 500,
            telemetry_period_ms: 250,
            rpc_timeout_ms: 200,
        }
    }
}

impl CadenceConfig {
    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_period_ms == 0 || self.telemetry_period_ms == 0 {
            return Err(ConfigError::invalid("cadences must be positive"));
        }
        // The scheduler may shorten the cycle down to half the base
        // cadence, and the RPC deadline must stay strictly below the
        // shortest possible delay.
        if self.rpc_timeout_ms == 0 || self.rpc_timeout_ms * 2 >= self.cycle_period_ms {
            return Err(ConfigError::invalid(format!(
                "rpc_timeout_ms {} must be positive and less than half of cycle_period_ms {}",
                self.rpc_timeout_ms, self.cycle_period_ms
            )));
        }
        Ok(())
    }
}

/// Guard-band hysteresis. How many consecutive in-band samples count as
/// "recovered" after a hard-ceiling halt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    pub recovery_samples: u32,
    pub recovery_threshold_pct: f64,
    pub scintillation_threshold: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            recovery_samples: 2,
            recovery_threshold_pct: 5.0,
            scintillation_threshold: 0.3,
        }
    }
}

impl GuardConfig {
    fn validate(&self, limits: &SafetyLimits) -> Result<(), ConfigError> {
        if self.recovery_samples == 0 {
            return Err(ConfigError::invalid("recovery_samples must be >= 1"));
        }
        if self.recovery_threshold_pct <= 0.0
            || self.recovery_threshold_pct > limits.qber_hard_ceiling_pct
        {
            return Err(ConfigError::invalid(format!(
                "recovery_threshold_pct {} must be in (0, {}]",
                self.recovery_threshold_pct, limits.qber_hard_ceiling_pct
            )));
        }
        if self.scintillation_threshold < 0.0 {
            return Err(ConfigError::invalid("scintillation_threshold must be >= 0"));
        }
        Ok(())
    }
}

/// DSCP / SRv6 steering mapping per traffic class. Advisory outputs
/// only; nothing here is safety-bearing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainMapping {
    pub urllc_dscp: Option<u8>,
    pub embb_dscp: Option<u8>,
    pub srv6_bsid_urllc: Option<String>,
    pub srv6_bsid_embb: Option<String>,
    #[serde(default)]
    pub mlo_prefer_6ghz: bool,
}

impl DomainMapping {
    pub fn dscp_for(&self, class: SloClass) -> Option<u8> {
        match class {
            SloClass::Urllc => self.urllc_dscp,
            SloClass::Embb => self.embb_dscp,
            SloClass::BestEffort => None,
        }
    }

    pub fn bsid_for(&self, class: SloClass) -> Option<&str> {
        match class {
            SloClass::Urllc => self.srv6_bsid_urllc.as_deref(),
            SloClass::Embb => self.srv6_bsid_embb.as_deref(),
            SloClass::BestEffort => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    pub class: SloClass,
    pub jitter_ps_target: f64,
    pub key_rate_min_bps: f64,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            class: SloClass::Urllc,
            jitter_ps_target: 50.0,
            key_rate_min_bps: 5.0e4,
        }
    }
}

impl SloConfig {
    pub fn slo(&self) -> Slo {
        Slo {
            cls: self.class,
            jitter_ps_target: self.jitter_ps_target,
            key_rate_min_bps: self.key_rate_min_bps,
        }
    }
}

/// One RPC peer: HTTP endpoint plus optional transport security material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub endpoint: String,
    /// PEM bundle added to the client's root store.
    pub ca: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub endpoint: String,
    /// Address of the controller's telemetry push stream (length-prefixed
    /// JSON frames over TCP).
    pub stream: String,
    pub ca: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Operator status endpoint. No HTTP server is started when unset.
    #[serde(default)]
    pub listen: Option<String>,
    pub controller: ControllerConfig,
    pub planner: EndpointConfig,
    #[serde(default)]
    pub safety: SafetyLimits,
    #[serde(default)]
    pub cadence: CadenceConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub mapping: DomainMapping,
    #[serde(default)]
    pub slo: SloConfig,
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller.endpoint.is_empty() {
            return Err(ConfigError::invalid("controller.endpoint is required"));
        }
        if self.controller.stream.is_empty() {
            return Err(ConfigError::invalid("controller.stream is required"));
        }
        if self.planner.endpoint.is_empty() {
            return Err(ConfigError::invalid("planner.endpoint is required"));
        }
        self.safety.validate()?;
        self.cadence.validate()?;
        self.guard.validate(&self.safety)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
            listen = "127.0.0.1:8480"

            [controller]
            endpoint = "http://127.0.0.1:7600"
            stream = "127.0.0.1:7601"

            [planner]
            endpoint = "http://127.0.0.1:7700"
        "#
        .to_string()
    }

    fn parse(s: &str) -> Result<BridgeConfig, ConfigError> {
        let config: BridgeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_published_defaults() {
        let config = parse(&minimal_toml()).unwrap();
        assert_eq!(config.safety.qber_hard_ceiling_pct, 11.0);
        assert_eq!(config.safety.mu_range, (0.05, 0.8));
        assert!(config.safety.shutter_guard);
        assert_eq!(config.cadence.cycle_period_ms, 500);
        assert_eq!(config.cadence.telemetry_period_ms, 250);
        assert_eq!(config.guard.recovery_samples, 2);
    }

    #[test]
    fn inverted_mu_range_is_rejected() {
        let toml = format!(
            "{}\n[safety]\nmu_range = [0.9, 0.1]\nrep_rate_hz_range = [1e6, 1e9]\n\
             amzi_phase_deg_limit = 15.0\nqber_hard_ceiling_pct = 11.0\nshutter_guard = true\n",
            minimal_toml()
        );
        let err = parse(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "got {err}");
    }

    #[test]
    fn zero_cadence_is_rejected() {
        let toml = format!(
            "{}\n[cadence]\ncycle_period_ms = 0\ntelemetry_period_ms = 250\nrpc_timeout_ms = 200\n",
            minimal_toml()
        );
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn rpc_timeout_must_undercut_half_cycle() {
        let toml = format!(
            "{}\n[cadence]\ncycle_period_ms = 500\ntelemetry_period_ms = 250\nrpc_timeout_ms = 250\n",
            minimal_toml()
        );
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn ceiling_can_tighten_but_not_loosen_silently() {
        let tightened = format!(
            "{}\n[safety]\nmu_range = [0.05, 0.8]\nrep_rate_hz_range = [1e6, 1e9]\n\
             amzi_phase_deg_limit = 15.0\nqber_hard_ceiling_pct = 8.0\nshutter_guard = true\n",
            minimal_toml()
        );
        assert!(parse(&tightened).is_ok());

        let loosened = tightened.replace("= 8.0", "= 14.0");
        assert!(parse(&loosened).is_err());

        let overridden = format!("{loosened}allow_ceiling_override = true\n");
        let config = parse(&overridden).unwrap();
        assert_eq!(config.safety.qber_hard_ceiling_pct, 14.0);
    }

    #[test]
    fn recovery_threshold_above_ceiling_is_rejected() {
        let toml = format!(
            "{}\n[guard]\nrecovery_samples = 2\nrecovery_threshold_pct = 12.0\n\
             scintillation_threshold = 0.3\n",
            minimal_toml()
        );
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn constraints_projection_carries_the_envelope() {
        let limits = SafetyLimits::default();
        let constraints = limits.constraints();
        assert_eq!(constraints.mu_min, 0.05);
        assert_eq!(constraints.mu_max, 0.8);
        assert_eq!(constraints.qber_hard_ceiling_pct, 11.0);
    }

    #[test]
    fn mapping_resolves_per_class() {
        let mapping = DomainMapping {
            urllc_dscp: Some(46),
            embb_dscp: Some(34),
            srv6_bsid_urllc: Some("FC00::A".to_string()),
            srv6_bsid_embb: None,
            mlo_prefer_6ghz: true,
        };
        assert_eq!(mapping.dscp_for(SloClass::Urllc), Some(46));
        assert_eq!(mapping.dscp_for(SloClass::BestEffort), None);
        assert_eq!(mapping.bsid_for(SloClass::Urllc), Some("FC00::A"));
        assert_eq!(mapping.bsid_for(SloClass::Embb), None);
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, minimal_toml()).unwrap();
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.listen.as_deref(), Some("127.0.0.1:8480"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = BridgeConfig::load(Path::new("/nonexistent/bridge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
