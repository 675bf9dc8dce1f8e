//! The bridge cycle loop.
//!
//! One cooperative cycle: read telemetry, classify the guard band,
//! request a plan if permitted, clamp it, actuate, schedule the next
//! cycle. The loop is the only writer of guard state, and it never has
//! two outstanding peer calls at once. Peer failures freeze the cycle;
//! only a validated config gets this far, so nothing here terminates
//! the process.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::clamp::clamp_overrides;
use crate::config::{BridgeConfig, CadenceConfig, DomainMapping, SafetyLimits, SloConfig};
use crate::controller::{ConfigureRequest, Controller, DecoyProfileRequest};
use crate::guard::{GuardMonitor, GuardState};
use crate::planner::Planner;
use crate::protocol::{ClockModel, DomainPolicy, HelloRequest, PlanRequest, PlanResponse};
use crate::scheduler::CycleScheduler;
use crate::telemetry::{TelemetryChannel, TelemetrySink};
use crate::version::{BRIDGE_VERSION, git_sha};

/// Bounded in-cycle retry for an unacknowledged shutter close. The
/// total backoff stays well under the cycle cap; anything left over is
/// retried on the next halted cycle.
const SHUTTER_RETRY_ATTEMPTS: u32 = 4;
const SHUTTER_BACKOFF_BASE: Duration = Duration::from_millis(25);

/// Operator-visible happenings, broadcast alongside the tracing output.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    GuardTransition {
        from: GuardState,
        to: GuardState,
        qber_pct: f64,
        episode: Option<Uuid>,
    },
    ShutterParked {
        episode: Option<Uuid>,
    },
    ShutterReopened,
    OverridesClamped,
    PlanSkipped {
        reason: String,
    },
    CycleSkipped {
        reason: String,
    },
}

/// Snapshot published for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeHealth {
    pub state: GuardState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_qber_pct: Option<f64>,
    pub cycles: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub version: &'static str,
}

impl Default for BridgeHealth {
    fn default() -> Self {
        Self {
            state: GuardState::Nominal,
            last_qber_pct: None,
            cycles: 0,
            session_id: None,
            version: BRIDGE_VERSION,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("planner handshake failed: {0}")]
    Planner(#[from] crate::planner::PlannerError),
    #[error("controller session setup failed: {0}")]
    Controller(#[from] crate::controller::ControllerError),
}

pub struct BridgeRuntime {
    limits: SafetyLimits,
    cadence: CadenceConfig,
    mapping: DomainMapping,
    slo: SloConfig,
    clock: ClockModel,

    planner: Arc<dyn Planner>,
    controller: Arc<dyn Controller>,
    telemetry: TelemetryChannel,
    sink: TelemetrySink,

    monitor: GuardMonitor,
    scheduler: CycleScheduler,

    session_id: Option<String>,
    /// Shutter close acknowledged for the current halt episode.
    shutter_acked: bool,
    keying_stopped: bool,
    /// Set on entering Halted, cleared once the post-recovery reopen and
    /// keying restart both succeed. No planning while pending.
    halt_cleanup_pending: bool,

    cycles: u64,
    events_tx: broadcast::Sender<BridgeEvent>,
    health_tx: watch::Sender<BridgeHealth>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BridgeRuntime {
    pub fn new(
        config: &BridgeConfig,
        planner: Arc<dyn Planner>,
        controller: Arc<dyn Controller>,
        telemetry: TelemetryChannel,
        sink: TelemetrySink,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        let (health_tx, _) = watch::channel(BridgeHealth::default());
        Self {
            limits: config.safety.clone(),
            cadence: config.cadence.clone(),
            mapping: config.mapping.clone(),
            slo: config.slo.clone(),
            clock: ClockModel::default(),
            planner,
            controller,
            telemetry,
            sink,
            monitor: GuardMonitor::new(&config.safety, &config.guard),
            scheduler: CycleScheduler::new(&config.cadence, &config.guard),
            session_id: None,
            shutter_acked: false,
            keying_stopped: false,
            halt_cleanup_pending: false,
            cycles: 0,
            events_tx,
            health_tx,
            shutdown_rx,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events_tx.subscribe()
    }

    pub fn health_rx(&self) -> watch::Receiver<BridgeHealth> {
        self.health_tx.subscribe()
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events_tx.send(event);
    }

    fn publish_health(&self, last_qber_pct: Option<f64>) {
        self.health_tx.send_replace(BridgeHealth {
            state: self.monitor.state(),
            last_qber_pct,
            cycles: self.cycles,
            session_id: self.session_id.clone(),
            version: BRIDGE_VERSION,
        });
    }

    fn initial_symbol_rate_mhz(&self) -> f64 {
        let (lo, hi) = self.limits.rep_rate_hz_range;
        (lo + hi) / 2.0 / 1.0e6
    }

    /// Handshake with both peers and bring up the keying session.
    ///
    /// Fails fast: a peer that cannot be reached at startup is a
    /// transport-initialization failure, not something to limp through.
    pub async fn start_session(&mut self) -> Result<(), StartupError> {
        let hello = self
            .planner
            .hello(&HelloRequest {
                plugin_name: "qbridge".to_string(),
                version: BRIDGE_VERSION.to_string(),
                git_sha: git_sha().to_string(),
            })
            .await?;
        tracing::info!(
            bridge_version = %hello.bridge_version,
            features = ?hello.features,
            "planner hello"
        );

        let caps = self.planner.describe().await?;
        tracing::info!(?caps, "planner capabilities");

        let ack = self.planner.set_clock_model(&self.clock).await?;
        if !ack.ok {
            tracing::warn!(msg = %ack.msg, "planner did not accept the clock model");
        }

        let symbol_rate_mhz = self.initial_symbol_rate_mhz();
        tracing::info!(symbol_rate_mhz, "configuring keying session");
        let session = self
            .controller
            .configure(&ConfigureRequest::bb84_time_bin(symbol_rate_mhz))
            .await?;
        self.controller.start_keying(&session.session_id).await?;
        tracing::info!(session_id = %session.session_id, "keying session started");
        self.session_id = Some(session.session_id);

        // Seed the mailbox so the first cycle has a snapshot even if the
        // push stream is still connecting.
        match self.controller.status().await {
            Ok(telemetry) => self.sink.publish(telemetry),
            Err(e) => tracing::warn!(error = %e, "initial status poll failed"),
        }

        self.publish_health(None);
        Ok(())
    }

    /// Run cycles until shutdown, then release the hardware.
    pub async fn run(mut self) {
        tracing::info!(
            cycle_ms = self.cadence.cycle_period_ms,
            qber_ceiling_pct = self.limits.qber_hard_ceiling_pct,
            "starting control loop"
        );
        let mut delay = self.scheduler.base();
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    delay = self.run_cycle().await;
                }
            }
        }
        self.release().await;
        tracing::info!("control loop exited");
    }

    /// One full cycle. Returns the delay before the next one.
    pub async fn run_cycle(&mut self) -> Duration {
        self.cycles += 1;
        let state_before = self.monitor.state();

        let Some(sample) = self.telemetry.latest() else {
            tracing::debug!(target: "qbridge::cycle", "no telemetry yet");
            self.emit(BridgeEvent::CycleSkipped {
                reason: "no telemetry".to_string(),
            });
            // An unacknowledged shutter close does not wait for the
            // stream to come back.
            if state_before.is_halted() {
                self.ensure_shutter_parked().await;
            }
            self.publish_health(None);
            return self.scheduler.next_delay(state_before, 0.0, None);
        };

        // Never actuate on a snapshot older than one cycle; skip, do not
        // fake a reading.
        if sample.age() > self.cadence.cycle_period() {
            tracing::warn!(
                target: "qbridge::cycle",
                age_ms = sample.age().as_millis(),
                "telemetry stale, skipping cycle"
            );
            self.emit(BridgeEvent::CycleSkipped {
                reason: "stale telemetry".to_string(),
            });
            if state_before.is_halted() {
                self.ensure_shutter_parked().await;
            }
            self.publish_health(None);
            return self
                .scheduler
                .next_delay(state_before, sample.telemetry.scintillation_idx, None);
        }
        let tel = sample.telemetry;

        if let Some(transition) = self.monitor.observe(tel.qber_pct) {
            tracing::warn!(
                target: "qbridge::guard",
                from = ?transition.from,
                to = ?transition.to,
                qber_pct = transition.qber_pct,
                "guard band transition"
            );
            if transition.to.is_halted() {
                self.shutter_acked = false;
                self.keying_stopped = false;
                self.halt_cleanup_pending = true;
            }
            self.emit(BridgeEvent::GuardTransition {
                from: transition.from,
                to: transition.to,
                qber_pct: transition.qber_pct,
                episode: self.monitor.halt_episode(),
            });
        }
        let state = self.monitor.state();

        if state.is_halted() {
            self.ensure_shutter_parked().await;
            self.publish_health(Some(tel.qber_pct));
            return self
                .scheduler
                .next_delay(state, tel.scintillation_idx, None);
        }

        if self.halt_cleanup_pending && !self.resume_keying().await {
            // Stay frozen until the shutter reopen and keying restart
            // both go through.
            self.publish_health(Some(tel.qber_pct));
            return self
                .scheduler
                .next_delay(state, tel.scintillation_idx, None);
        }

        let request = PlanRequest {
            clock: self.clock,
            tel: tel.clone(),
            limits: self.limits.constraints(),
            slo: self.slo.slo(),
        };
        let plan = match self.planner.plan_cycle(&request).await {
            Ok(plan) => plan,
            Err(e) => {
                // Freeze, never guess: no actuation this cycle.
                tracing::warn!(target: "qbridge::cycle", error = %e, "plan request failed");
                self.emit(BridgeEvent::PlanSkipped {
                    reason: e.to_string(),
                });
                self.publish_health(Some(tel.qber_pct));
                return self
                    .scheduler
                    .next_delay(state, tel.scintillation_idx, None);
            }
        };
        if !plan.rationale.is_empty() {
            tracing::debug!(target: "qbridge::cycle", rationale = %plan.rationale, "plan received");
        }

        let (clamped, modified) = clamp_overrides(&plan, &self.limits);
        if modified {
            tracing::warn!(
                target: "qbridge::cycle",
                "plan exceeded the safety envelope, clamped"
            );
            self.emit(BridgeEvent::OverridesClamped);
        }

        self.apply_plan(&clamped).await;
        self.publish_health(Some(tel.qber_pct));

        let hint = (clamped.next_cycle_ms > 0).then_some(clamped.next_cycle_ms);
        self.scheduler
            .next_delay(state, tel.scintillation_idx, hint)
    }

    /// Park the shutter for the current halt episode. Retries with
    /// exponential backoff inside the cycle; an unacknowledged close is
    /// a safety-critical condition and is retried every halted cycle.
    async fn ensure_shutter_parked(&mut self) {
        if self.shutter_acked {
            return;
        }
        let episode = self.monitor.halt_episode();

        if !self.keying_stopped
            && let Some(session) = self.session_id.clone()
        {
            match self.controller.stop_keying(&session).await {
                Ok(_) => self.keying_stopped = true,
                Err(e) => {
                    tracing::warn!(target: "qbridge::cycle", error = %e, "stop keying failed")
                }
            }
        }

        let mut attempt = 0;
        loop {
            match self.controller.set_shutter(false).await {
                Ok(ack) if ack.ok => {
                    tracing::error!(
                        target: "qbridge::guard",
                        episode = ?episode,
                        "shutter parked"
                    );
                    self.shutter_acked = true;
                    self.emit(BridgeEvent::ShutterParked { episode });
                    return;
                }
                Ok(ack) => {
                    tracing::warn!(target: "qbridge::guard", msg = %ack.msg, "shutter close not acknowledged");
                }
                Err(e) => {
                    tracing::warn!(target: "qbridge::guard", error = %e, "shutter close failed");
                }
            }
            attempt += 1;
            if attempt > SHUTTER_RETRY_ATTEMPTS {
                tracing::error!(
                    target: "qbridge::guard",
                    episode = ?episode,
                    attempts = attempt,
                    "shutter close unacknowledged, retrying next cycle"
                );
                return;
            }
            let backoff = SHUTTER_BACKOFF_BASE * (1 << attempt.min(6));
            tokio::time::sleep(backoff).await;
        }
    }

    /// Reopen the shutter and restart keying after recovery. Returns
    /// true once both succeeded.
    async fn resume_keying(&mut self) -> bool {
        match self.controller.set_shutter(true).await {
            Ok(ack) if ack.ok => {
                self.shutter_acked = false;
                self.emit(BridgeEvent::ShutterReopened);
            }
            Ok(ack) => {
                tracing::warn!(target: "qbridge::cycle", msg = %ack.msg, "shutter reopen not acknowledged");
                return false;
            }
            Err(e) => {
                tracing::warn!(target: "qbridge::cycle", error = %e, "shutter reopen failed");
                return false;
            }
        }

        if let Some(session) = self.session_id.clone() {
            match self.controller.start_keying(&session).await {
                Ok(_) => self.keying_stopped = false,
                Err(e) => {
                    tracing::warn!(target: "qbridge::cycle", error = %e, "keying restart failed");
                    return false;
                }
            }
        }

        tracing::info!(target: "qbridge::cycle", "keying resumed after recovery");
        self.halt_cleanup_pending = false;
        true
    }

    /// Actuate a clamped plan. Controller failures here are recoverable:
    /// logged and retried naturally on the next cycle.
    async fn apply_plan(&mut self, plan: &PlanResponse) {
        let Some(session) = self.session_id.clone() else {
            tracing::warn!(target: "qbridge::cycle", "no session, dropping plan");
            return;
        };

        if let Some(tx) = &plan.tx {
            if let Some(decoys) = &tx.decoys {
                let request = DecoyProfileRequest {
                    session_id: session.clone(),
                    mu_signal: decoys.mu_signal,
                    mu_decoy: decoys.mu_decoy,
                    vacuum_prob: decoys.vac_prob,
                };
                tracing::debug!(target: "qbridge::cycle", ?request, "applying decoy profile");
                if let Err(e) = self.controller.set_decoy_profile(&request).await {
                    tracing::warn!(target: "qbridge::cycle", error = %e, "decoy profile apply failed");
                }
            }

            if tx.rep_rate_hz > 0.0 {
                let symbol_rate_mhz = tx.rep_rate_hz / 1.0e6;
                tracing::debug!(target: "qbridge::cycle", symbol_rate_mhz, "nudging symbol rate");
                match self
                    .controller
                    .configure(&ConfigureRequest::bb84_time_bin(symbol_rate_mhz))
                    .await
                {
                    Ok(response) => self.session_id = Some(response.session_id),
                    Err(e) => {
                        tracing::warn!(target: "qbridge::cycle", error = %e, "symbol rate apply failed")
                    }
                }
            }
        }

        if let Some(phase) = &plan.phase
            && phase.amzi_phase_deg.abs() > 0.1
        {
            tracing::debug!(
                target: "qbridge::cycle",
                amzi_phase_deg = phase.amzi_phase_deg,
                "requesting interferometer phase calibration"
            );
            if let Err(e) = self.controller.calibrate("MZI_PHASE").await {
                tracing::warn!(target: "qbridge::cycle", error = %e, "calibration request failed");
            }
        }

        if let Some(domain) = &plan.domain {
            self.publish_domain_policy(domain);
        }
    }

    /// Advisory steering outputs. Resolved against the configured
    /// per-class mapping; nothing here touches the hardware.
    fn publish_domain_policy(&self, domain: &DomainPolicy) {
        let class = self.slo.class;
        let dscp = domain.dscp.or_else(|| self.mapping.dscp_for(class));
        let bsid = domain
            .srv6_bsid
            .as_deref()
            .or_else(|| self.mapping.bsid_for(class));

        tracing::debug!(
            target: "qbridge::cycle",
            preferred = ?domain.preferred,
            dscp,
            bsid,
            "domain preference"
        );
        if domain.mlo_prefer_6ghz || self.mapping.mlo_prefer_6ghz {
            tracing::debug!(target: "qbridge::cycle", "prefer 6 GHz MLO leg");
        }
    }

    /// Shutdown path: stop keying and, with the shutter guard enabled,
    /// park the shutter on the way out. Best effort by design.
    async fn release(&mut self) {
        if let Some(session) = self.session_id.clone()
            && !self.keying_stopped
            && let Err(e) = self.controller.stop_keying(&session).await
        {
            tracing::warn!(error = %e, "stop keying during shutdown failed");
        }
        if self.limits.shutter_guard
            && let Err(e) = self.controller.set_shutter(false).await
        {
            tracing::error!(error = %e, "failed to park shutter during shutdown");
        }
    }
}
