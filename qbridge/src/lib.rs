//! qbridge: safety-gated planning bridge for a quantum key link.
//!
//! Sits between the quantum-link hardware controller and a pluggable
//! cycle planner. Every planning cycle it reads link telemetry,
//! classifies the QBER into a guard band, asks the planner for the next
//! cycle's overrides, clamps them against the hardware safety envelope
//! and actuates the clamped result. A hard-ceiling breach parks the
//! optical shutter and suppresses planning until the link recovers.

pub mod clamp;
pub mod codec;
pub mod config;
pub mod controller;
pub mod guard;
pub mod http;
pub mod planner;
pub mod protocol;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;
mod version;

pub use clamp::clamp_overrides;
pub use config::{BridgeConfig, ConfigError, SafetyLimits};
pub use controller::{Controller, ControllerError, HttpController};
pub use guard::{GuardMonitor, GuardState, GuardTransition, classify};
pub use planner::{HttpPlanner, Planner, PlannerError};
pub use runtime::{BridgeEvent, BridgeHealth, BridgeRuntime};
pub use scheduler::CycleScheduler;
pub use telemetry::{TelemetryChannel, TelemetrySink};
pub use version::{BRIDGE_VERSION, git_sha};
