//! Mock CSI Identity Service
//!
//! Reports the mock plugin's name and readiness. Every call is recorded.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::config::DriverConfig;
use crate::csi;
use crate::driver::complete_call;
use crate::metrics::CallTimer;
use crate::recorder::{CallRecord, CallRecorder, methods};

pub const DRIVER_NAME: &str = "io.kubernetes.storage.mock";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Mock CSI Identity Service
pub struct MockIdentityService {
    config: Arc<DriverConfig>,
    recorder: CallRecorder,
}

impl MockIdentityService {
    pub fn new(config: Arc<DriverConfig>, recorder: CallRecorder) -> Self {
        Self { config, recorder }
    }
}

#[tonic::async_trait]
impl csi::Identity for MockIdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        let timer = CallTimer::new(methods::GET_PLUGIN_INFO);
        let response = csi::GetPluginInfoResponse {
            name: self.config.driver_name.clone(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: std::collections::HashMap::new(),
        };

        complete_call(
            &self.config,
            &self.recorder,
            timer,
            CallRecord::new(methods::GET_PLUGIN_INFO, ""),
            Ok(response),
        )
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let timer = CallTimer::new(methods::GET_PLUGIN_CAPABILITIES);

        // Node-only plugin: no controller service
        let response = csi::GetPluginCapabilitiesResponse {
            capabilities: Vec::new(),
        };

        complete_call(
            &self.config,
            &self.recorder,
            timer,
            CallRecord::new(methods::GET_PLUGIN_CAPABILITIES, ""),
            Ok(response),
        )
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        let timer = CallTimer::new(methods::PROBE);

        complete_call(
            &self.config,
            &self.recorder,
            timer,
            CallRecord::new(methods::PROBE, ""),
            Ok(csi::ProbeResponse { ready: Some(true) }),
        )
    }
}
