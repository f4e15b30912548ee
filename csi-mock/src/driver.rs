//! The mock driver: Identity + Node services sharing one call log.

use std::sync::Arc;

use tonic::{Code, Response, Status};
use tracing::error;

use crate::config::{DriverConfig, DriverRegistration};
use crate::identity::MockIdentityService;
use crate::metrics::{self, CallTimer};
use crate::node::MockNodeService;
use crate::recorder::{CallRecord, CallRecorder, RecorderError};

/// Record a call and turn the handler result into an RPC response.
///
/// A canned failure configured for the method replaces a successful result.
/// The record is appended before the response is returned.
pub(crate) fn complete_call<T>(
    config: &DriverConfig,
    recorder: &CallRecorder,
    timer: CallTimer,
    record: CallRecord,
    result: Result<T, Status>,
) -> Result<Response<T>, Status> {
    let result = result.and_then(|response| match config.failure_for(&record.method) {
        Some(failure) => Err(failure.to_status()),
        None => Ok(response),
    });

    let record = match &result {
        Ok(_) => record,
        Err(status) => record.with_error(status),
    };

    match recorder.append(record) {
        Ok(_) => {}
        Err(RecorderError::Sealed { method }) => metrics::record_late_call(&method),
        Err(RecorderError::Poisoned) => {
            error!("Call log lock poisoned, call not recorded");
            timer.failure(Code::Internal);
            return Err(Status::internal("mock call log is corrupted"));
        }
    }

    match result {
        Ok(response) => {
            timer.success();
            Ok(Response::new(response))
        }
        Err(status) => {
            timer.failure(status.code());
            Err(status)
        }
    }
}

/// A mock CSI driver instance for one scenario run.
///
/// Owns its configuration and call log; nothing is process-global.
pub struct MockDriver {
    config: Arc<DriverConfig>,
    recorder: CallRecorder,
    identity: Arc<MockIdentityService>,
    node: Arc<MockNodeService>,
}

impl MockDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self::with_recorder(config, CallRecorder::new())
    }

    /// Create a driver that appends to an existing recorder.
    pub fn with_recorder(config: DriverConfig, recorder: CallRecorder) -> Self {
        let config = Arc::new(config);
        Self {
            identity: Arc::new(MockIdentityService::new(config.clone(), recorder.clone())),
            node: Arc::new(MockNodeService::new(config.clone(), recorder.clone())),
            config,
            recorder,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn identity(&self) -> Arc<MockIdentityService> {
        self.identity.clone()
    }

    pub fn node(&self) -> Arc<MockNodeService> {
        self.node.clone()
    }

    pub fn recorder(&self) -> &CallRecorder {
        &self.recorder
    }

    /// Whether the orchestrator should call NodePublishVolume periodically.
    pub fn requires_republish(&self) -> bool {
        self.config.requires_republish.unwrap_or(false)
    }

    /// The CSIDriver object for this driver, if deployed.
    pub fn registration(&self) -> Option<DriverRegistration> {
        self.config.registration()
    }

    /// Snapshot of every call received so far.
    pub fn get_calls(&self) -> Result<Vec<CallRecord>, RecorderError> {
        self.recorder.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::{self, Identity, Node};
    use crate::recorder::methods;
    use crate::types::TokenRequest;
    use tonic::Request;

    #[test]
    fn test_requires_republish() {
        assert!(!MockDriver::new(DriverConfig::new("n")).requires_republish());
        assert!(
            !MockDriver::new(DriverConfig::new("n").requires_republish(Some(false)))
                .requires_republish()
        );
        assert!(
            MockDriver::new(DriverConfig::new("n").requires_republish(Some(true)))
                .requires_republish()
        );
    }

    #[test]
    fn test_registration_follows_config() {
        let driver = MockDriver::new(
            DriverConfig::new("n")
                .registered(false)
                .token_requests(vec![TokenRequest::default()]),
        );
        assert!(driver.registration().is_none());
    }

    #[tokio::test]
    async fn test_services_share_call_log() {
        let driver = MockDriver::new(DriverConfig::new("n"));

        Identity::probe(driver.identity().as_ref(), Request::new(csi::ProbeRequest {}))
            .await
            .unwrap();
        Node::node_publish_volume(
            driver.node().as_ref(),
            Request::new(csi::NodePublishVolumeRequest {
                volume_id: "vol-1".to_string(),
                target_path: "/mnt/target".to_string(),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        let calls = driver.get_calls().unwrap();
        let names: Vec<&str> = calls.iter().map(|c| c.method.as_str()).collect();
        assert_eq!(names, vec![methods::PROBE, methods::NODE_PUBLISH_VOLUME]);
    }

    #[tokio::test]
    async fn test_late_call_after_seal_is_served_but_not_recorded() {
        let driver = MockDriver::new(DriverConfig::new("n"));
        driver.recorder().seal().unwrap();

        Node::node_get_info(driver.node().as_ref(), Request::new(csi::NodeGetInfoRequest {}))
            .await
            .unwrap();

        assert!(driver.get_calls().unwrap().is_empty());
        assert_eq!(driver.recorder().rejected_count(), 1);
    }

    #[tokio::test]
    async fn test_poisoned_log_fails_call_with_internal() {
        let driver = MockDriver::new(DriverConfig::new("n"));
        driver.recorder().poison();

        let status = Node::node_publish_volume(
            driver.node().as_ref(),
            Request::new(csi::NodePublishVolumeRequest {
                volume_id: "vol-1".to_string(),
                target_path: "/mnt/target".to_string(),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(driver.get_calls().unwrap_err(), RecorderError::Poisoned);

        // The failed call was not recorded
        driver.recorder().reset();
        assert!(driver.get_calls().unwrap().is_empty());
    }
}
