//! Scenario configuration.
//!
//! A [`ScenarioConfig`] is the declarative input of one run: whether the
//! driver is registered, which tokens it asks for, and whether it wants
//! periodic republish. Scenario tables are JSON arrays of [`ScenarioSpec`]
//! and can be loaded from disk; the service-account-token table is built in.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use csi_mock::{DriverConfig, TokenRequest};

use crate::checker::{ExpectedShape, ExpirationCheck};

/// Shortest token lifetime the API server accepts for a CSIDriver token request.
pub const MIN_TOKEN_EXPIRATION_SECONDS: i64 = 600;
/// Longest token lifetime the API server accepts (2^32 seconds).
pub const MAX_TOKEN_EXPIRATION_SECONDS: i64 = 1 << 32;

/// Default wait for republish calls to accumulate before the pod is deleted.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);
/// Default interval between republish calls of the simulated kubelet.
pub const DEFAULT_REPUBLISH_PERIOD: Duration = Duration::from_secs(1);

fn default_true() -> bool {
    true
}

/// Declarative parameters of one scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioConfig {
    /// Whether a CSIDriver object is deployed
    #[serde(default = "default_true")]
    pub driver_registered: bool,
    /// Non-empty enables the service-account-token feature
    #[serde(default)]
    pub token_requests: Vec<TokenRequest>,
    #[serde(default)]
    pub requires_republish: Option<bool>,
    #[serde(default)]
    pub pod_info_on_mount: bool,
    #[serde(default)]
    pub stage_unstage: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            driver_registered: true,
            token_requests: Vec::new(),
            requires_republish: None,
            pod_info_on_mount: false,
            stage_unstage: false,
        }
    }
}

impl ScenarioConfig {
    /// The shape used by the service-account-token scenarios: republish is
    /// required exactly when tokens are requested.
    pub fn service_account_token(driver_registered: bool, token_requests: Vec<TokenRequest>) -> Self {
        let enabled = !token_requests.is_empty();
        Self {
            driver_registered,
            token_requests,
            requires_republish: Some(enabled),
            ..Self::default()
        }
    }

    pub fn token_feature_enabled(&self) -> bool {
        !self.token_requests.is_empty()
    }

    /// Tokens reach the driver only through a deployed CSIDriver object.
    pub fn tokens_plumbed(&self) -> bool {
        self.driver_registered && self.token_feature_enabled()
    }

    /// The kubelet only reads `requiresRepublish` from a deployed CSIDriver object.
    pub fn republish_effective(&self) -> bool {
        self.driver_registered && self.requires_republish.unwrap_or(false)
    }

    /// Mock driver configuration for this scenario.
    pub fn driver_config(&self, node_id: &str) -> DriverConfig {
        DriverConfig::new(node_id)
            .registered(self.driver_registered)
            .token_requests(self.token_requests.clone())
            .requires_republish(self.requires_republish)
            .pod_info_on_mount(self.pod_info_on_mount)
            .stage_unstage(self.stage_unstage)
    }

    /// What the call log must look like after the pod has come and gone.
    ///
    /// Republish only sets a lower bound of two publishes; the exact count
    /// depends on orchestrator timing.
    pub fn expected_shape(&self) -> ExpectedShape {
        let credential_expected = self.tokens_plumbed();
        let expiration_seconds = if credential_expected {
            self.token_requests
                .first()
                .map(TokenRequest::effective_expiration_seconds)
        } else {
            None
        };

        ExpectedShape {
            min_calls: if self.republish_effective() { 2 } else { 1 },
            credential_expected,
            expiration_seconds,
            expiration_check: ExpirationCheck::default(),
            expect_staging: self.stage_unstage,
            expect_unpublish: true,
            expected_pod_info: None,
        }
    }

    /// Reject configurations the API server would refuse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut audiences = HashSet::new();
        for request in &self.token_requests {
            if let Some(seconds) = request.expiration_seconds {
                if seconds < MIN_TOKEN_EXPIRATION_SECONDS {
                    return Err(ConfigError::Invalid(format!(
                        "expirationSeconds {} is shorter than {} seconds",
                        seconds, MIN_TOKEN_EXPIRATION_SECONDS
                    )));
                }
                if seconds > MAX_TOKEN_EXPIRATION_SECONDS {
                    return Err(ConfigError::Invalid(format!(
                        "expirationSeconds {} is longer than 2^32 seconds",
                        seconds
                    )));
                }
            }

            if !audiences.insert(request.audience_key()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate token audience '{}'",
                    request.audience_key()
                )));
            }
        }
        Ok(())
    }
}

/// A named scenario in a scenario table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,
    #[serde(flatten)]
    pub config: ScenarioConfig,
}

impl ScenarioSpec {
    pub fn new(name: impl Into<String>, config: ScenarioConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Timing of the stimulus phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StimulusTiming {
    pub settle_delay: Duration,
    pub republish_period: Duration,
}

impl Default for StimulusTiming {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            republish_period: DEFAULT_REPUBLISH_PERIOD,
        }
    }
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid scenario: {0}")]
    Invalid(String),
}

/// The service-account-token scenario table.
pub fn builtin_scenarios() -> Vec<ScenarioSpec> {
    vec![
        ScenarioSpec::new(
            "token should not be plumbed down when csiServiceAccountTokenEnabled=false",
            ScenarioConfig::service_account_token(true, Vec::new()),
        ),
        ScenarioSpec::new(
            "token should not be plumbed down when CSIDriver is not deployed",
            ScenarioConfig::service_account_token(false, vec![TokenRequest::default()]),
        ),
        ScenarioSpec::new(
            "token should be plumbed down when csiServiceAccountTokenEnabled=true",
            ScenarioConfig::service_account_token(true, vec![TokenRequest::with_expiration(600)]),
        ),
    ]
}

/// Parse and validate a scenario table.
pub fn parse_scenarios(json: &str) -> Result<Vec<ScenarioSpec>, ConfigError> {
    let specs: Vec<ScenarioSpec> = serde_json::from_str(json)?;

    let mut names = HashSet::new();
    for spec in &specs {
        if spec.name.trim().is_empty() {
            return Err(ConfigError::Invalid("scenario name cannot be empty".to_string()));
        }
        if !names.insert(spec.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate scenario name '{}'",
                spec.name
            )));
        }
        spec.config.validate()?;
    }

    Ok(specs)
}

/// Load a scenario table from a JSON file.
pub async fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<ScenarioSpec>, ConfigError> {
    let contents = tokio::fs::read_to_string(path.as_ref()).await?;
    parse_scenarios(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_matches_token_scenarios() {
        let specs = builtin_scenarios();
        assert_eq!(specs.len(), 3);

        let disabled = &specs[0].config;
        assert!(disabled.driver_registered);
        assert!(!disabled.token_feature_enabled());
        assert_eq!(disabled.requires_republish, Some(false));

        let unregistered = &specs[1].config;
        assert!(!unregistered.driver_registered);
        assert!(unregistered.token_feature_enabled());
        assert!(!unregistered.tokens_plumbed());
        assert!(!unregistered.republish_effective());

        let enabled = &specs[2].config;
        assert!(enabled.tokens_plumbed());
        assert!(enabled.republish_effective());
    }

    #[test]
    fn test_expected_shape_without_tokens() {
        let shape = ScenarioConfig::service_account_token(true, Vec::new()).expected_shape();
        assert_eq!(shape.min_calls, 1);
        assert!(!shape.credential_expected);
        assert_eq!(shape.expiration_seconds, None);
        assert!(shape.expect_unpublish);
    }

    #[test]
    fn test_expected_shape_unregistered() {
        let shape =
            ScenarioConfig::service_account_token(false, vec![TokenRequest::default()])
                .expected_shape();
        assert_eq!(shape.min_calls, 1);
        assert!(!shape.credential_expected);
    }

    #[test]
    fn test_expected_shape_with_tokens() {
        let shape = ScenarioConfig::service_account_token(
            true,
            vec![TokenRequest::with_expiration(600)],
        )
        .expected_shape();
        assert_eq!(shape.min_calls, 2);
        assert!(shape.credential_expected);
        assert_eq!(shape.expiration_seconds, Some(600));
    }

    #[test]
    fn test_expected_shape_tokens_without_republish() {
        let config = ScenarioConfig {
            token_requests: vec![TokenRequest::default()],
            requires_republish: None,
            ..ScenarioConfig::default()
        };
        let shape = config.expected_shape();
        assert_eq!(shape.min_calls, 1);
        assert!(shape.credential_expected);
        assert_eq!(shape.expiration_seconds, Some(3600));
    }

    #[test]
    fn test_driver_config_mapping() {
        let config = ScenarioConfig {
            stage_unstage: true,
            pod_info_on_mount: true,
            ..ScenarioConfig::service_account_token(true, vec![TokenRequest::default()])
        };
        let driver = config.driver_config("node-1");
        assert_eq!(driver.node_id, "node-1");
        assert!(driver.registered);
        assert!(driver.stage_unstage);
        assert!(driver.pod_info_on_mount);
        assert_eq!(driver.requires_republish, Some(true));
    }

    #[test]
    fn test_parse_scenarios_defaults() {
        let specs = parse_scenarios(
            r#"[
                {"name": "plain"},
                {"name": "tokens", "tokenRequests": [{"expirationSeconds": 600}], "requiresRepublish": true},
                {"name": "unregistered", "driverRegistered": false, "tokenRequests": [{}]}
            ]"#,
        )
        .unwrap();

        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].config, ScenarioConfig::default());
        assert_eq!(specs[1].config.token_requests[0].expiration_seconds, Some(600));
        assert_eq!(specs[1].config.requires_republish, Some(true));
        assert!(!specs[2].config.driver_registered);
    }

    #[test]
    fn test_parse_scenarios_rejects_invalid() {
        assert!(matches!(
            parse_scenarios(r#"[{"name": ""}]"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_scenarios(r#"[{"name": "a"}, {"name": "a"}]"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_scenarios(r#"[{"name": "a", "tokenRequests": [{"expirationSeconds": 60}]}]"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_scenarios(r#"[{"name": "a", "tokenRequests": [{}, {"audience": ""}]}]"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(parse_scenarios("{"), Err(ConfigError::Json(_))));
    }
}
