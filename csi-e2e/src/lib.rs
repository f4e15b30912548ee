//! CSI Service Account Token Scenarios
//!
//! Drives the mock CSI driver through pod lifecycles and checks what the
//! driver saw: whether service-account tokens were plumbed down, with the
//! requested lifetime, and whether the volume was republished.
//!
//! The library is split into several modules:
//! - `config`: scenario configuration and the built-in scenario table
//! - `kubelet`: simulated kubelet that stages, publishes and republishes
//! - `checker`: verification of a frozen call log
//! - `scenario`: the scenario state machine and runner
//! - `metrics`: Prometheus metrics collection

pub mod checker;
pub mod config;
pub mod kubelet;
pub mod metrics;
pub mod scenario;

pub use checker::{
    CallSummary, ExpectedShape, ExpirationCheck, FailureKind, FailureReport, verify,
};
pub use config::{
    ConfigError, ScenarioConfig, ScenarioSpec, StimulusTiming, builtin_scenarios,
    load_scenarios, parse_scenarios,
};
pub use kubelet::{Kubelet, KubeletError, KubeletOptions, Pod, PodHandle};
pub use scenario::{
    Phase, Scenario, ScenarioError, ScenarioOptions, ScenarioOutcome, Verdict, run_scenario,
};
