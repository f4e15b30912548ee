//! Integration tests for csi-e2e
//!
//! These tests run whole scenarios against the mock driver with shortened
//! timing and inspect both the verdict and the raw call log.
//! Tests focus on:
//! - The service-account-token scenario table
//! - Exact publish counts when republish is off
//! - Cleanup of abandoned scenarios
//! - Scenario tables loaded from disk

use std::io::Write;
use std::time::Duration;

use csi_e2e::checker::FailureKind;
use csi_e2e::config::{self, ScenarioConfig, StimulusTiming};
use csi_e2e::scenario::{Phase, Scenario, ScenarioOptions, Verdict, run_scenario};
use csi_mock::{CallRecord, ServiceAccountTokens, TokenRequest, methods};

fn fast_options() -> ScenarioOptions {
    ScenarioOptions::new("e2e-node").with_timing(StimulusTiming {
        settle_delay: Duration::from_millis(300),
        republish_period: Duration::from_millis(50),
    })
}

fn publishes(log: &[CallRecord]) -> Vec<&CallRecord> {
    log.iter()
        .filter(|c| c.method == methods::NODE_PUBLISH_VOLUME)
        .collect()
}

/// Run a scenario by hand and return its log, sealed, before verification.
async fn run_to_stop(config: ScenarioConfig, running_for: Duration) -> (Scenario, Vec<CallRecord>) {
    let mut scenario = Scenario::new("manual", config, fast_options());
    scenario.configure().unwrap();
    scenario.start().await.unwrap();
    tokio::time::sleep(running_for).await;
    scenario.stop().await.unwrap();
    let log = scenario.calls().unwrap();
    (scenario, log)
}

// ============================================================================
// Token Scenario Tests
// ============================================================================

/// Registered driver, token feature disabled: one publish, no token
#[tokio::test]
async fn test_token_not_plumbed_when_feature_disabled() {
    let config = ScenarioConfig::service_account_token(true, Vec::new());
    let (mut scenario, log) = run_to_stop(config, Duration::from_millis(200)).await;

    let calls = publishes(&log);
    assert_eq!(calls.len(), 1);
    assert!(calls.iter().all(|c| c.credential.is_none()));
    assert!(scenario.verify().unwrap().is_pass());
}

/// Token requests configured but no CSIDriver object: one publish, no token
#[tokio::test]
async fn test_token_not_plumbed_when_driver_not_registered() {
    let config = ScenarioConfig::service_account_token(false, vec![TokenRequest::default()]);
    let (mut scenario, log) = run_to_stop(config, Duration::from_millis(200)).await;

    let calls = publishes(&log);
    assert_eq!(calls.len(), 1);
    assert!(calls.iter().all(|c| c.credential.is_none()));
    assert!(scenario.verify().unwrap().is_pass());
}

/// Registered driver, 600s tokens, republish required: repeated publishes with tokens
#[tokio::test]
async fn test_token_plumbed_and_republished() {
    let config =
        ScenarioConfig::service_account_token(true, vec![TokenRequest::with_expiration(600)]);
    let outcome = run_scenario("tokens", config, &fast_options())
        .await
        .unwrap();

    let Verdict::Pass(summary) = &outcome.verdict else {
        panic!("expected pass, got {:?}", outcome.verdict);
    };
    assert!(summary.publish_calls >= 2);
    assert_eq!(summary.credentialed_calls, summary.publish_calls);
    assert_eq!(summary.volume_ids.len(), 1);
}

/// Every republish carries a fresh token with the requested lifetime
#[tokio::test]
async fn test_republished_tokens_are_fresh() {
    let config =
        ScenarioConfig::service_account_token(true, vec![TokenRequest::with_expiration(600)]);
    let (_scenario, log) = run_to_stop(config, Duration::from_millis(200)).await;

    let calls = publishes(&log);
    assert!(calls.len() >= 2);

    let mut seen = Vec::new();
    for call in calls {
        let tokens = ServiceAccountTokens::parse(call.credential.as_deref().unwrap()).unwrap();
        let (_, status) = tokens.iter().next().unwrap();
        let remaining = (status.expiration_timestamp - call.observed_at).whole_seconds();
        assert!((595..=605).contains(&remaining), "remaining {}", remaining);
        seen.push(status.token.clone());
    }
    seen.dedup();
    assert!(seen.len() >= 2, "republish should mint a new token");
}

/// The built-in table passes end to end
#[tokio::test]
async fn test_builtin_scenarios_pass() {
    let options = fast_options();
    for spec in config::builtin_scenarios() {
        let outcome = run_scenario(&spec.name, spec.config, &options)
            .await
            .unwrap();
        assert!(outcome.verdict.is_pass(), "{}: {:?}", spec.name, outcome.verdict);
    }
}

// ============================================================================
// Republish Count Tests
// ============================================================================

/// Without requiresRepublish the publish count is exactly one, however long the pod runs
#[tokio::test]
async fn test_no_republish_means_exactly_one_publish() {
    for requires_republish in [None, Some(false)] {
        let config = ScenarioConfig {
            token_requests: vec![TokenRequest::default()],
            requires_republish,
            ..ScenarioConfig::default()
        };
        let (mut scenario, log) = run_to_stop(config, Duration::from_millis(250)).await;
        assert_eq!(publishes(&log).len(), 1, "requires_republish = {:?}", requires_republish);
        assert!(scenario.verify().unwrap().is_pass());
    }
}

/// A settle delay shorter than the republish period leaves too few calls
#[tokio::test]
async fn test_insufficient_calls_when_settle_too_short() {
    let options = ScenarioOptions::new("e2e-node").with_timing(StimulusTiming {
        settle_delay: Duration::from_millis(10),
        republish_period: Duration::from_secs(30),
    });
    let config =
        ScenarioConfig::service_account_token(true, vec![TokenRequest::with_expiration(600)]);

    let outcome = run_scenario("too short", config, &options).await.unwrap();
    let report = outcome.verdict.failure().unwrap();
    assert_eq!(report.kind, FailureKind::InsufficientCalls);
}

/// Staging and pod info flow through the full run
#[tokio::test]
async fn test_staged_volume_with_pod_info() {
    let config = ScenarioConfig {
        stage_unstage: true,
        pod_info_on_mount: true,
        ..ScenarioConfig::service_account_token(true, vec![TokenRequest::with_expiration(3600)])
    };
    let (mut scenario, log) = run_to_stop(config, Duration::from_millis(120)).await;

    let names: Vec<&str> = log.iter().map(|c| c.method.as_str()).collect();
    let stage = names.iter().position(|m| *m == methods::NODE_STAGE_VOLUME).unwrap();
    let publish = names.iter().position(|m| *m == methods::NODE_PUBLISH_VOLUME).unwrap();
    assert!(stage < publish);
    assert_eq!(names.last(), Some(&methods::NODE_UNSTAGE_VOLUME));

    assert!(scenario.verify().unwrap().is_pass());
}

// ============================================================================
// Cleanup Tests
// ============================================================================

/// Dropping a running scenario stops republishing and clears the log
#[tokio::test]
async fn test_drop_cleans_up_running_scenario() {
    let config =
        ScenarioConfig::service_account_token(true, vec![TokenRequest::with_expiration(600)]);
    let mut scenario = Scenario::new("abandoned", config, fast_options());
    scenario.configure().unwrap();
    scenario.start().await.unwrap();
    assert_eq!(scenario.phase(), Phase::Running);

    let recorder = scenario.recorder().unwrap().clone();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!recorder.is_empty());

    drop(scenario);
    assert!(recorder.is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(recorder.is_empty(), "republish must not outlive the scenario");
}

/// Cleanup also runs after a failed verdict
#[tokio::test]
async fn test_cleanup_after_failed_verdict() {
    let options = ScenarioOptions::new("e2e-node").with_timing(StimulusTiming {
        settle_delay: Duration::ZERO,
        republish_period: Duration::from_secs(30),
    });
    let config =
        ScenarioConfig::service_account_token(true, vec![TokenRequest::with_expiration(600)]);

    let mut scenario = Scenario::new("failing", config, options);
    scenario.configure().unwrap();
    let recorder = scenario.recorder().unwrap().clone();
    scenario.start().await.unwrap();
    scenario.settle().await.unwrap();
    scenario.stop().await.unwrap();
    assert!(!scenario.verify().unwrap().is_pass());

    drop(scenario);
    assert!(recorder.is_empty());
    assert!(recorder.is_sealed());
}

/// Cleanup holds on a multi-thread runtime, where republish runs on other workers
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drop_cleans_up_while_republish_runs_elsewhere() {
    let options = ScenarioOptions::new("e2e-node").with_timing(StimulusTiming {
        settle_delay: Duration::ZERO,
        republish_period: Duration::from_micros(50),
    });
    let config =
        ScenarioConfig::service_account_token(true, vec![TokenRequest::with_expiration(600)]);

    let mut dirty = 0;
    for _ in 0..200 {
        let mut scenario = Scenario::new("abandoned", config.clone(), options.clone());
        scenario.configure().unwrap();
        scenario.start().await.unwrap();
        let recorder = scenario.recorder().unwrap().clone();

        tokio::time::sleep(Duration::from_millis(2)).await;
        drop(scenario);
        tokio::time::sleep(Duration::from_millis(2)).await;

        if !recorder.is_empty() {
            dirty += 1;
        }
    }
    assert_eq!(dirty, 0, "scenarios with records after cleanup");
}

// ============================================================================
// Scenario Table Tests
// ============================================================================

/// Scenario tables load from JSON files and run like the built-in ones
#[tokio::test]
async fn test_scenarios_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"[
            {{"name": "no tokens", "requiresRepublish": false}},
            {{"name": "vault tokens", "tokenRequests": [{{"audience": "vault", "expirationSeconds": 900}}], "requiresRepublish": true, "podInfoOnMount": true}}
        ]"#
    )
    .unwrap();

    let specs = config::load_scenarios(file.path()).await.unwrap();
    assert_eq!(specs.len(), 2);

    let options = fast_options();
    for spec in specs {
        let outcome = run_scenario(&spec.name, spec.config, &options)
            .await
            .unwrap();
        assert!(outcome.verdict.is_pass(), "{}: {:?}", spec.name, outcome.verdict);
    }
}

/// Missing files surface as I/O errors
#[tokio::test]
async fn test_missing_scenario_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = config::load_scenarios(dir.path().join("absent.json")).await;
    assert!(matches!(result, Err(config::ConfigError::Io(_))));
}
