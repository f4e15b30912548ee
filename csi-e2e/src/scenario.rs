//! Scenario runner.
//!
//! A [`Scenario`] walks one configuration through
//! `Idle → Configured → Running → Stopped → Verified`. Each transition is
//! checked; calling one out of order is an error, not a panic. Cleanup runs
//! in [`Drop`], so a scenario that fails or is abandoned halfway still stops
//! its republish task and clears its call log.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use csi_mock::{CallRecord, CallRecorder, MockDriver, RecorderError};

use crate::checker::{self, CallSummary, ExpectedShape, FailureKind, FailureReport};
use crate::config::{ConfigError, ScenarioConfig, StimulusTiming};
use crate::kubelet::{Kubelet, KubeletError, KubeletOptions, Pod, PodHandle};
use crate::metrics::{self, PhaseTimer};

/// Name of the pod every scenario creates.
pub const POD_NAME: &str = "pvc-volume-tester";

/// Lifecycle phase of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Configured,
    Running,
    Stopped,
    Verified,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "Idle",
            Phase::Configured => "Configured",
            Phase::Running => "Running",
            Phase::Stopped => "Stopped",
            Phase::Verified => "Verified",
        };
        f.write_str(name)
    }
}

/// Error type for scenario runs.
///
/// Verification failures are not errors; they come back as [`Verdict::Fail`].
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("cannot {action} a scenario in phase {phase}")]
    InvalidTransition { phase: Phase, action: &'static str },
    #[error("invalid scenario configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] KubeletError),
    #[error("call recorder error: {0}")]
    Recorder(#[from] RecorderError),
}

/// Outcome of verifying one call log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum Verdict {
    Pass(CallSummary),
    Fail(FailureReport),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass(_))
    }

    pub fn failure(&self) -> Option<&FailureReport> {
        match self {
            Verdict::Pass(_) => None,
            Verdict::Fail(report) => Some(report),
        }
    }
}

/// Where and how fast a scenario runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioOptions {
    pub node_id: String,
    pub timing: StimulusTiming,
}

impl ScenarioOptions {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            timing: StimulusTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: StimulusTiming) -> Self {
        self.timing = timing;
        self
    }
}

/// One scenario run against a fresh mock driver.
pub struct Scenario {
    name: String,
    config: ScenarioConfig,
    options: ScenarioOptions,
    phase: Phase,
    driver: Option<Arc<MockDriver>>,
    kubelet: Option<Kubelet>,
    pod: Option<PodHandle>,
    expected: Option<ExpectedShape>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, config: ScenarioConfig, options: ScenarioOptions) -> Self {
        Self {
            name: name.into(),
            config,
            options,
            phase: Phase::Idle,
            driver: None,
            kubelet: None,
            pod: None,
            expected: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The driver created by [`Scenario::configure`].
    pub fn driver(&self) -> Option<&Arc<MockDriver>> {
        self.driver.as_ref()
    }

    pub fn recorder(&self) -> Option<&CallRecorder> {
        self.driver.as_ref().map(|d| d.recorder())
    }

    /// Expected call log shape, known once configured.
    pub fn expected(&self) -> Option<&ExpectedShape> {
        self.expected.as_ref()
    }

    fn require(&self, phase: Phase, action: &'static str) -> Result<(), ScenarioError> {
        if self.phase != phase {
            return Err(ScenarioError::InvalidTransition {
                phase: self.phase,
                action,
            });
        }
        Ok(())
    }

    fn parts(&self, action: &'static str) -> Result<(&Arc<MockDriver>, &Kubelet), ScenarioError> {
        match (&self.driver, &self.kubelet) {
            (Some(driver), Some(kubelet)) => Ok((driver, kubelet)),
            _ => Err(ScenarioError::InvalidTransition {
                phase: self.phase,
                action,
            }),
        }
    }

    /// Create the mock driver and its empty call log.
    pub fn configure(&mut self) -> Result<(), ScenarioError> {
        self.require(Phase::Idle, "configure")?;
        self.config.validate()?;

        let driver = Arc::new(MockDriver::new(
            self.config.driver_config(&self.options.node_id),
        ));
        let kubelet = Kubelet::new(
            driver.clone(),
            KubeletOptions::new(&self.options.node_id, self.options.timing.republish_period),
        );

        self.expected = Some(self.config.expected_shape());
        self.driver = Some(driver);
        self.kubelet = Some(kubelet);
        self.phase = Phase::Configured;

        info!(
            scenario = %self.name,
            registered = self.config.driver_registered,
            token_requests = self.config.token_requests.len(),
            requires_republish = ?self.config.requires_republish,
            "Scenario configured"
        );
        Ok(())
    }

    /// Register the plugin and create the pod whose volume the driver serves.
    pub async fn start(&mut self) -> Result<(), ScenarioError> {
        self.require(Phase::Configured, "start")?;
        let timer = PhaseTimer::new("start");

        let (_, kubelet) = self.parts("start")?;
        kubelet.register_plugin().await?;

        let id = Uuid::new_v4().simple().to_string();
        let pod = Pod::new(
            &format!("csi-mock-{}", &id[..8]),
            POD_NAME,
            format!("csi-{}", id),
        );
        let pod_info = pod.info.clone();
        let handle = kubelet.create_pod(pod).await?;

        if self.config.driver_registered
            && self.config.pod_info_on_mount
            && let Some(expected) = self.expected.take()
        {
            self.expected = Some(expected.with_pod_info(pod_info));
        }

        self.pod = Some(handle);
        self.phase = Phase::Running;
        timer.finish();
        Ok(())
    }

    /// Give the orchestrator time to republish.
    ///
    /// Only waits when tokens reach the driver or republish is in effect;
    /// otherwise the single publish from [`Scenario::start`] is all there is.
    pub async fn settle(&self) -> Result<(), ScenarioError> {
        self.require(Phase::Running, "settle")?;

        if self.config.tokens_plumbed() || self.config.republish_effective() {
            let delay = self.options.timing.settle_delay;
            debug!(scenario = %self.name, delay_ms = delay.as_millis() as u64, "Waiting for republish");
            let timer = PhaseTimer::new("settle");
            tokio::time::sleep(delay).await;
            timer.finish();
        }
        Ok(())
    }

    /// Delete the pod and freeze the call log.
    ///
    /// The log is sealed even when deleting the pod fails, so the scenario
    /// can still be verified.
    pub async fn stop(&mut self) -> Result<(), ScenarioError> {
        self.require(Phase::Running, "stop")?;
        let timer = PhaseTimer::new("stop");

        let pod = self.pod.take();
        let (driver, kubelet) = self.parts("stop")?;
        let deleted = match pod {
            Some(handle) => kubelet.delete_pod(handle).await,
            None => Ok(()),
        };
        driver.recorder().seal()?;

        self.phase = Phase::Stopped;
        timer.finish();
        deleted?;
        Ok(())
    }

    /// Snapshot of the call log so far.
    pub fn calls(&self) -> Result<Vec<CallRecord>, ScenarioError> {
        let (driver, _) = self.parts("read calls of")?;
        Ok(driver.get_calls()?)
    }

    /// Check the frozen call log. Runs at most once.
    pub fn verify(&mut self) -> Result<Verdict, ScenarioError> {
        self.require(Phase::Stopped, "verify")?;
        let (driver, _) = self.parts("verify")?;

        let verdict = match (driver.get_calls(), self.expected.as_ref()) {
            (Ok(log), Some(expected)) => match checker::verify(&log, expected) {
                Ok(summary) => Verdict::Pass(summary),
                Err(report) => Verdict::Fail(report),
            },
            (Ok(_), None) => {
                return Err(ScenarioError::InvalidTransition {
                    phase: self.phase,
                    action: "verify",
                });
            }
            (Err(e), _) => Verdict::Fail(FailureReport::new(
                FailureKind::RecorderCorruption,
                e.to_string(),
            )),
        };

        let late = driver.recorder().rejected_count();
        if late > 0 {
            warn!(scenario = %self.name, late_calls = late, "Calls arrived after the log was sealed");
        }

        match &verdict {
            Verdict::Pass(summary) => {
                metrics::record_pass(summary.publish_calls);
                info!(
                    scenario = %self.name,
                    publish_calls = summary.publish_calls,
                    credentialed_calls = summary.credentialed_calls,
                    "Scenario passed"
                );
            }
            Verdict::Fail(report) => {
                metrics::record_failure(report.kind);
                warn!(scenario = %self.name, kind = %report.kind, detail = %report.detail, "Scenario failed");
            }
        }

        self.phase = Phase::Verified;
        Ok(verdict)
    }
}

impl Drop for Scenario {
    fn drop(&mut self) {
        // Seal first: an aborted republish task may still be mid-call on
        // another worker and must not land in the log
        if let Some(driver) = &self.driver
            && let Err(e) = driver.recorder().seal()
        {
            debug!(scenario = %self.name, error = %e, "Could not seal call log during cleanup");
        }
        // Aborts the republish task if the pod was never deleted
        if let Some(handle) = self.pod.take() {
            debug!(scenario = %self.name, pod = %handle.pod().info, "Abandoning running pod");
        }
        if let Some(driver) = self.driver.take() {
            driver.recorder().reset();
        }
        self.kubelet = None;
        debug!(scenario = %self.name, phase = %self.phase, "Scenario cleaned up");
    }
}

/// Result of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioOutcome {
    pub name: String,
    pub verdict: Verdict,
    pub duration_secs: f64,
}

/// Run a scenario end to end: configure, start, settle, stop, verify.
pub async fn run_scenario(
    name: &str,
    config: ScenarioConfig,
    options: &ScenarioOptions,
) -> Result<ScenarioOutcome, ScenarioError> {
    let started = Instant::now();
    let mut scenario = Scenario::new(name, config, options.clone());

    scenario.configure()?;
    scenario.start().await?;
    scenario.settle().await?;
    scenario.stop().await?;
    let verdict = scenario.verify()?;

    Ok(ScenarioOutcome {
        name: name.to_string(),
        verdict,
        duration_secs: started.elapsed().as_secs_f64(),
    })
}
