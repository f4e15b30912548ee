//! Simulated kubelet.
//!
//! Drives a mock driver through one pod's volume lifecycle the way the real
//! volume manager does: stage (when the driver supports it), publish with
//! pod info and freshly minted service-account tokens, republish on a timer
//! while the driver asks for it, then unpublish and unstage on pod deletion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::{Request, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;

use csi_mock::csi::{self, Node};
use csi_mock::types::SERVICE_ACCOUNT_TOKENS_KEY;
use csi_mock::{
    DriverRegistration, MockDriver, PodInfo, ServiceAccountTokens, TokenError, TokenStatus,
};

/// Error type for kubelet operations.
#[derive(Debug, thiserror::Error)]
pub enum KubeletError {
    #[error("CSI call failed: {0}")]
    Rpc(#[from] Status),
    #[error("failed to mint service account tokens: {0}")]
    Token(#[from] TokenError),
}

/// Kubelet settings.
#[derive(Debug, Clone)]
pub struct KubeletOptions {
    pub node_id: String,
    /// Interval between republish calls
    pub republish_period: Duration,
    pub root_dir: String,
}

impl KubeletOptions {
    pub fn new(node_id: impl Into<String>, republish_period: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            republish_period,
            root_dir: "/var/lib/kubelet".to_string(),
        }
    }
}

/// A pod with one persistent volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub info: PodInfo,
    pub volume_id: String,
}

impl Pod {
    /// A pod in `namespace` using the default service account.
    pub fn new(namespace: &str, name: &str, volume_id: impl Into<String>) -> Self {
        Self {
            info: PodInfo {
                name: name.to_string(),
                namespace: namespace.to_string(),
                uid: Uuid::new_v4().to_string(),
                service_account: "default".to_string(),
            },
            volume_id: volume_id.into(),
        }
    }
}

/// Everything needed to issue one NodePublishVolume for a pod.
#[derive(Clone)]
struct Publisher {
    node: Arc<dyn Node>,
    registration: Option<DriverRegistration>,
    pod: Pod,
    target_path: String,
    staging_target_path: String,
}

impl Publisher {
    fn mint_tokens(&self) -> Result<Option<String>, TokenError> {
        let Some(registration) = self.registration.as_ref().filter(|r| r.wants_tokens()) else {
            return Ok(None);
        };

        let now = OffsetDateTime::now_utc();
        let mut tokens = ServiceAccountTokens::new();
        for request in &registration.token_requests {
            tokens.insert(
                request.audience_key(),
                TokenStatus {
                    token: Uuid::new_v4().simple().to_string(),
                    expiration_timestamp: now
                        + time::Duration::seconds(request.effective_expiration_seconds()),
                },
            );
        }
        Ok(Some(tokens.encode()?))
    }

    fn volume_context(&self) -> Result<HashMap<String, String>, TokenError> {
        let mut volume_context = HashMap::new();

        if self
            .registration
            .as_ref()
            .is_some_and(|r| r.pod_info_on_mount)
        {
            for (key, value) in self.pod.info.volume_context_entries() {
                volume_context.insert(key.to_string(), value);
            }
        }

        if let Some(tokens) = self.mint_tokens()? {
            volume_context.insert(SERVICE_ACCOUNT_TOKENS_KEY.to_string(), tokens);
        }

        Ok(volume_context)
    }

    async fn publish(&self) -> Result<(), KubeletError> {
        let request = csi::NodePublishVolumeRequest {
            volume_id: self.pod.volume_id.clone(),
            staging_target_path: self.staging_target_path.clone(),
            target_path: self.target_path.clone(),
            volume_context: self.volume_context()?,
            ..Default::default()
        };
        self.node.node_publish_volume(Request::new(request)).await?;
        Ok(())
    }
}

/// A running pod. Dropping it stops republishing without unpublishing.
pub struct PodHandle {
    publisher: Publisher,
    staged: bool,
    stop: watch::Sender<bool>,
    republisher: Option<JoinHandle<()>>,
}

impl PodHandle {
    pub fn pod(&self) -> &Pod {
        &self.publisher.pod
    }

    pub fn is_republishing(&self) -> bool {
        self.republisher.is_some()
    }
}

impl Drop for PodHandle {
    fn drop(&mut self) {
        if let Some(task) = self.republisher.take() {
            task.abort();
        }
    }
}

/// Simulated kubelet bound to one driver.
pub struct Kubelet {
    driver: Arc<MockDriver>,
    options: KubeletOptions,
}

impl Kubelet {
    pub fn new(driver: Arc<MockDriver>, options: KubeletOptions) -> Self {
        Self { driver, options }
    }

    /// Plugin registration handshake: GetPluginInfo then NodeGetInfo.
    ///
    /// Returns the driver name the plugin reports.
    pub async fn register_plugin(&self) -> Result<String, KubeletError> {
        use csi_mock::csi::Identity;

        let info = self
            .driver
            .identity()
            .get_plugin_info(Request::new(csi::GetPluginInfoRequest {}))
            .await?
            .into_inner();

        let node = self
            .driver
            .node()
            .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
            .await?
            .into_inner();

        if node.node_id != self.options.node_id {
            return Err(Status::failed_precondition(format!(
                "plugin reports node '{}', kubelet runs on '{}'",
                node.node_id, self.options.node_id
            ))
            .into());
        }

        info!(
            driver_name = %info.name,
            vendor_version = %info.vendor_version,
            node_id = %node.node_id,
            "Registered CSI plugin"
        );
        Ok(info.name)
    }

    async fn supports_staging(&self) -> Result<bool, Status> {
        use csi::node_service_capability::{Type, rpc};

        let capabilities = self
            .driver
            .node()
            .node_get_capabilities(Request::new(csi::NodeGetCapabilitiesRequest {}))
            .await?
            .into_inner()
            .capabilities;

        Ok(capabilities.iter().any(|cap| {
            matches!(
                &cap.r#type,
                Some(Type::Rpc(r)) if r.r#type == rpc::Type::StageUnstageVolume as i32
            )
        }))
    }

    fn staging_path(&self, volume_id: &str) -> String {
        format!(
            "{}/plugins/kubernetes.io/csi/{}/{}/globalmount",
            self.options.root_dir,
            self.driver.config().driver_name,
            volume_id
        )
    }

    fn target_path(&self, pod: &Pod) -> String {
        format!(
            "{}/pods/{}/volumes/kubernetes.io~csi/{}/mount",
            self.options.root_dir, pod.info.uid, pod.volume_id
        )
    }

    /// Mount the pod's volume and start republishing if the driver asks for it.
    pub async fn create_pod(&self, pod: Pod) -> Result<PodHandle, KubeletError> {
        let staged = self.supports_staging().await?;
        let staging_target_path = self.staging_path(&pod.volume_id);

        if staged {
            let request = csi::NodeStageVolumeRequest {
                volume_id: pod.volume_id.clone(),
                staging_target_path: staging_target_path.clone(),
                ..Default::default()
            };
            self.driver
                .node()
                .node_stage_volume(Request::new(request))
                .await?;
        }

        let registration = self.driver.registration();
        let publisher = Publisher {
            node: self.driver.node(),
            target_path: self.target_path(&pod),
            staging_target_path: if staged {
                staging_target_path
            } else {
                String::new()
            },
            registration,
            pod,
        };

        publisher.publish().await?;
        info!(
            pod = %publisher.pod.info,
            volume_id = %publisher.pod.volume_id,
            "Pod volume published"
        );

        // requiresRepublish is only read from a deployed CSIDriver object
        let republish = publisher.registration.is_some() && self.driver.requires_republish();

        let (stop, stop_rx) = watch::channel(false);
        let republisher = if republish {
            Some(tokio::spawn(republish_loop(
                publisher.clone(),
                self.options.republish_period,
                stop_rx,
            )))
        } else {
            None
        };

        Ok(PodHandle {
            publisher,
            staged,
            stop,
            republisher,
        })
    }

    /// Stop republishing, then unpublish and unstage the pod's volume.
    pub async fn delete_pod(&self, mut handle: PodHandle) -> Result<(), KubeletError> {
        let _ = handle.stop.send(true);
        if let Some(task) = handle.republisher.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Republish task ended abnormally");
        }

        let pod = handle.pod().clone();
        let request = csi::NodeUnpublishVolumeRequest {
            volume_id: pod.volume_id.clone(),
            target_path: handle.publisher.target_path.clone(),
        };
        self.driver
            .node()
            .node_unpublish_volume(Request::new(request))
            .await?;

        if handle.staged {
            let request = csi::NodeUnstageVolumeRequest {
                volume_id: pod.volume_id.clone(),
                staging_target_path: handle.publisher.staging_target_path.clone(),
            };
            self.driver
                .node()
                .node_unstage_volume(Request::new(request))
                .await?;
        }

        info!(pod = %pod.info, volume_id = %pod.volume_id, "Pod deleted");
        Ok(())
    }
}

async fn republish_loop(publisher: Publisher, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately; the initial publish already happened
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match publisher.publish().await {
                    Ok(()) => debug!(volume_id = %publisher.pod.volume_id, "Volume republished"),
                    Err(e) => warn!(volume_id = %publisher.pod.volume_id, error = %e, "Republish failed, will retry"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi_mock::{DriverConfig, TokenRequest, methods};

    fn kubelet(config: DriverConfig, period: Duration) -> (Kubelet, Arc<MockDriver>) {
        let driver = Arc::new(MockDriver::new(config));
        (
            Kubelet::new(driver.clone(), KubeletOptions::new("node-1", period)),
            driver,
        )
    }

    fn publishes(driver: &MockDriver) -> Vec<csi_mock::CallRecord> {
        driver
            .get_calls()
            .unwrap()
            .into_iter()
            .filter(|c| c.method == methods::NODE_PUBLISH_VOLUME)
            .collect()
    }

    #[tokio::test]
    async fn test_publish_without_registration_carries_nothing() {
        let config = DriverConfig::new("node-1")
            .registered(false)
            .token_requests(vec![TokenRequest::default()])
            .requires_republish(Some(true))
            .pod_info_on_mount(true);
        let (kubelet, driver) = kubelet(config, Duration::from_millis(10));

        let handle = kubelet
            .create_pod(Pod::new("ns", "pod", "vol-1"))
            .await
            .unwrap();
        assert!(!handle.is_republishing());
        kubelet.delete_pod(handle).await.unwrap();

        let calls = publishes(&driver);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].volume_context.is_empty());
    }

    #[tokio::test]
    async fn test_tokens_minted_per_request() {
        let config = DriverConfig::new("node-1").token_requests(vec![
            TokenRequest::with_expiration(600),
            TokenRequest {
                audience: Some("vault".to_string()),
                expiration_seconds: None,
            },
        ]);
        let (kubelet, driver) = kubelet(config, Duration::from_millis(10));

        let handle = kubelet
            .create_pod(Pod::new("ns", "pod", "vol-1"))
            .await
            .unwrap();
        kubelet.delete_pod(handle).await.unwrap();

        let calls = publishes(&driver);
        let tokens = ServiceAccountTokens::parse(calls[0].credential.as_deref().unwrap()).unwrap();
        let audiences: Vec<&String> = tokens.iter().map(|(a, _)| a).collect();
        assert_eq!(audiences, vec!["", "vault"]);
    }

    #[tokio::test]
    async fn test_pod_info_on_mount() {
        let config = DriverConfig::new("node-1").pod_info_on_mount(true);
        let (kubelet, driver) = kubelet(config, Duration::from_millis(10));

        let pod = Pod::new("ns", "pod", "vol-1");
        let uid = pod.info.uid.clone();
        let handle = kubelet.create_pod(pod).await.unwrap();
        kubelet.delete_pod(handle).await.unwrap();

        let calls = publishes(&driver);
        assert_eq!(
            calls[0].volume_context.get(csi_mock::types::POD_UID_KEY),
            Some(&uid)
        );
    }

    #[tokio::test]
    async fn test_republish_until_deleted() {
        let config = DriverConfig::new("node-1").requires_republish(Some(true));
        let (kubelet, driver) = kubelet(config, Duration::from_millis(20));

        let handle = kubelet
            .create_pod(Pod::new("ns", "pod", "vol-1"))
            .await
            .unwrap();
        assert!(handle.is_republishing());
        tokio::time::sleep(Duration::from_millis(150)).await;
        kubelet.delete_pod(handle).await.unwrap();

        let after_delete = publishes(&driver).len();
        assert!(after_delete >= 2, "expected republish, got {}", after_delete);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(publishes(&driver).len(), after_delete);

        let last = driver.get_calls().unwrap().pop().unwrap();
        assert_eq!(last.method, methods::NODE_UNPUBLISH_VOLUME);
    }

    #[tokio::test]
    async fn test_staging_when_supported() {
        let config = DriverConfig::new("node-1").stage_unstage(true);
        let (kubelet, driver) = kubelet(config, Duration::from_millis(10));

        let handle = kubelet
            .create_pod(Pod::new("ns", "pod", "vol-1"))
            .await
            .unwrap();
        kubelet.delete_pod(handle).await.unwrap();

        let names: Vec<String> = driver
            .get_calls()
            .unwrap()
            .into_iter()
            .map(|c| c.method)
            .collect();
        assert_eq!(
            names,
            vec![
                methods::NODE_GET_CAPABILITIES,
                methods::NODE_STAGE_VOLUME,
                methods::NODE_PUBLISH_VOLUME,
                methods::NODE_UNPUBLISH_VOLUME,
                methods::NODE_UNSTAGE_VOLUME,
            ]
        );
    }

    #[tokio::test]
    async fn test_register_plugin_checks_node_id() {
        let (kubelet, driver) = kubelet(DriverConfig::new("node-1"), Duration::from_millis(10));
        assert_eq!(
            kubelet.register_plugin().await.unwrap(),
            csi_mock::identity::DRIVER_NAME
        );
        assert_eq!(driver.get_calls().unwrap().len(), 2);

        let other = Kubelet::new(
            Arc::new(MockDriver::new(DriverConfig::new("other-node"))),
            KubeletOptions::new("node-1", Duration::from_millis(10)),
        );
        let err = other.register_plugin().await.unwrap_err();
        assert!(
            matches!(err, KubeletError::Rpc(ref s) if s.code() == tonic::Code::FailedPrecondition)
        );
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let config = DriverConfig::new("node-1").with_failure(
            methods::NODE_PUBLISH_VOLUME,
            tonic::Code::Internal,
            "mount failed",
        );
        let (kubelet, driver) = kubelet(config, Duration::from_millis(10));

        let err = kubelet
            .create_pod(Pod::new("ns", "pod", "vol-1"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, KubeletError::Rpc(ref s) if s.code() == tonic::Code::Internal));
        assert_eq!(publishes(&driver).len(), 1);
    }
}
