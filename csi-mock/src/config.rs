//! Mock driver behavior parameters.
//!
//! [`DriverConfig`] is the explicit, per-run description of how the mock
//! behaves. [`DriverRegistration`] is the part the kubelet would read from
//! the cluster's CSIDriver object; it only exists when the driver is
//! registered.

use std::collections::HashMap;

use tonic::{Code, Status};

use crate::identity::DRIVER_NAME;
use crate::types::TokenRequest;

/// Error injected for a given method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CannedFailure {
    pub code: Code,
    pub message: String,
}

impl CannedFailure {
    pub fn to_status(&self) -> Status {
        Status::new(self.code, self.message.clone())
    }
}

/// What the kubelet learns from a deployed CSIDriver object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverRegistration {
    pub driver_name: String,
    pub token_requests: Vec<TokenRequest>,
    pub requires_republish: bool,
    pub pod_info_on_mount: bool,
}

impl DriverRegistration {
    /// True when the kubelet should mint service-account tokens.
    pub fn wants_tokens(&self) -> bool {
        !self.token_requests.is_empty()
    }
}

/// Configuration for one mock driver instance.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub node_id: String,
    /// Whether a CSIDriver object is deployed for this driver
    pub registered: bool,
    pub token_requests: Vec<TokenRequest>,
    pub requires_republish: Option<bool>,
    pub pod_info_on_mount: bool,
    /// Advertise STAGE_UNSTAGE_VOLUME
    pub stage_unstage: bool,
    failures: HashMap<&'static str, CannedFailure>,
}

impl DriverConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            driver_name: DRIVER_NAME.to_string(),
            node_id: node_id.into(),
            registered: true,
            token_requests: Vec::new(),
            requires_republish: None,
            pod_info_on_mount: false,
            stage_unstage: false,
            failures: HashMap::new(),
        }
    }

    pub fn registered(mut self, registered: bool) -> Self {
        self.registered = registered;
        self
    }

    pub fn token_requests(mut self, token_requests: Vec<TokenRequest>) -> Self {
        self.token_requests = token_requests;
        self
    }

    pub fn requires_republish(mut self, requires_republish: Option<bool>) -> Self {
        self.requires_republish = requires_republish;
        self
    }

    pub fn pod_info_on_mount(mut self, enabled: bool) -> Self {
        self.pod_info_on_mount = enabled;
        self
    }

    pub fn stage_unstage(mut self, enabled: bool) -> Self {
        self.stage_unstage = enabled;
        self
    }

    /// Make every call to `method` fail with the given status.
    /// The call is still recorded.
    pub fn with_failure(
        mut self,
        method: &'static str,
        code: Code,
        message: impl Into<String>,
    ) -> Self {
        self.failures.insert(
            method,
            CannedFailure {
                code,
                message: message.into(),
            },
        );
        self
    }

    pub fn failure_for(&self, method: &str) -> Option<&CannedFailure> {
        self.failures.get(method)
    }

    /// Service-account tokens are enabled for this driver.
    pub fn token_feature_enabled(&self) -> bool {
        !self.token_requests.is_empty()
    }

    /// The CSIDriver object the kubelet sees, if deployed.
    pub fn registration(&self) -> Option<DriverRegistration> {
        if !self.registered {
            return None;
        }

        Some(DriverRegistration {
            driver_name: self.driver_name.clone(),
            token_requests: self.token_requests.clone(),
            requires_republish: self.requires_republish.unwrap_or(false),
            pod_info_on_mount: self.pod_info_on_mount,
        })
    }
}
