//! Mock CSI Node Service
//!
//! Accepts stage/publish/unpublish/unstage calls without touching the host.
//! Each call is appended to the call log before the response is returned,
//! whether the call succeeds, fails validation, or hits a canned failure.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::info;

use crate::config::DriverConfig;
use crate::csi;
use crate::driver::complete_call;
use crate::metrics::CallTimer;
use crate::recorder::{CallRecord, CallRecorder, methods};

/// Mock CSI Node Service
pub struct MockNodeService {
    config: Arc<DriverConfig>,
    recorder: CallRecorder,
}

impl MockNodeService {
    pub fn new(config: Arc<DriverConfig>, recorder: CallRecorder) -> Self {
        Self { config, recorder }
    }

    fn validate_volume_id(volume_id: &str) -> Result<(), Status> {
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        Ok(())
    }

    /// Validate a kubelet-supplied path.
    fn validate_path(path: &str, what: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument(format!("{} is required", what)));
        }

        if !path.starts_with('/') {
            return Err(Status::invalid_argument(format!("{} must be absolute", what)));
        }

        if path.contains("..") {
            return Err(Status::invalid_argument(format!(
                "{} cannot contain '..' (path traversal)",
                what
            )));
        }

        Ok(())
    }
}

#[tonic::async_trait]
impl csi::Node for MockNodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = CallTimer::new(methods::NODE_STAGE_VOLUME);
        let req = request.into_inner();

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeStageVolume request"
        );

        let result = Self::validate_volume_id(&req.volume_id)
            .and_then(|()| Self::validate_path(&req.staging_target_path, "Staging target path"))
            .and_then(|()| {
                if self.config.stage_unstage {
                    Ok(csi::NodeStageVolumeResponse {})
                } else {
                    Err(Status::unimplemented(
                        "NodeStageVolume requires STAGE_UNSTAGE_VOLUME",
                    ))
                }
            });

        let record = CallRecord::new(methods::NODE_STAGE_VOLUME, req.volume_id.as_str())
            .with_volume_context(&req.volume_context);
        complete_call(&self.config, &self.recorder, timer, record, result)
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = CallTimer::new(methods::NODE_UNSTAGE_VOLUME);
        let req = request.into_inner();

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeUnstageVolume request"
        );

        let result = Self::validate_volume_id(&req.volume_id)
            .and_then(|()| Self::validate_path(&req.staging_target_path, "Staging target path"))
            .map(|()| csi::NodeUnstageVolumeResponse {});

        let record = CallRecord::new(methods::NODE_UNSTAGE_VOLUME, req.volume_id.as_str());
        complete_call(&self.config, &self.recorder, timer, record, result)
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = CallTimer::new(methods::NODE_PUBLISH_VOLUME);
        let req = request.into_inner();
        let record = CallRecord::new(methods::NODE_PUBLISH_VOLUME, req.volume_id.as_str())
            .with_volume_context(&req.volume_context);

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            readonly = %req.readonly,
            has_token = record.has_credential(),
            "NodePublishVolume request"
        );

        let result = Self::validate_volume_id(&req.volume_id)
            .and_then(|()| Self::validate_path(&req.target_path, "Target path"))
            .and_then(|()| {
                if self.config.stage_unstage {
                    Self::validate_path(&req.staging_target_path, "Staging target path")
                } else {
                    Ok(())
                }
            })
            .map(|()| csi::NodePublishVolumeResponse {});

        complete_call(&self.config, &self.recorder, timer, record, result)
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = CallTimer::new(methods::NODE_UNPUBLISH_VOLUME);
        let req = request.into_inner();

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        let result = Self::validate_volume_id(&req.volume_id)
            .and_then(|()| Self::validate_path(&req.target_path, "Target path"))
            .map(|()| csi::NodeUnpublishVolumeResponse {});

        let record = CallRecord::new(methods::NODE_UNPUBLISH_VOLUME, req.volume_id.as_str());
        complete_call(&self.config, &self.recorder, timer, record, result)
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        let timer = CallTimer::new(methods::NODE_GET_INFO);

        let response = csi::NodeGetInfoResponse {
            node_id: self.config.node_id.clone(),
            max_volumes_per_node: 0, // No limit
        };

        complete_call(
            &self.config,
            &self.recorder,
            timer,
            CallRecord::new(methods::NODE_GET_INFO, ""),
            Ok(response),
        )
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let timer = CallTimer::new(methods::NODE_GET_CAPABILITIES);

        let mut capabilities = Vec::new();
        if self.config.stage_unstage {
            capabilities.push(csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc {
                        r#type: csi::node_service_capability::rpc::Type::StageUnstageVolume as i32,
                    },
                )),
            });
        }

        complete_call(
            &self.config,
            &self.recorder,
            timer,
            CallRecord::new(methods::NODE_GET_CAPABILITIES, ""),
            Ok(csi::NodeGetCapabilitiesResponse { capabilities }),
        )
    }
}
