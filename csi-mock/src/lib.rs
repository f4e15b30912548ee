//! Mock CSI Driver Library
//!
//! In-process stand-in for a CSI node plugin used by end-to-end scenarios.
//! It serves the Identity and Node calls an orchestrator would make, records
//! every call with its payload, and lets a verifier read the call log back.
//!
//! This library provides:
//! - CSI message types and service traits for the calls the mock serves
//! - A concurrency-safe, append-only call recorder
//! - Configurable mock Identity and Node services
//! - Typed service-account token and pod-info volume-context payloads

pub mod config;
pub mod csi;
pub mod driver;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod recorder;
pub mod types;

pub use config::{CannedFailure, DriverConfig, DriverRegistration};
pub use driver::MockDriver;
pub use identity::MockIdentityService;
pub use node::MockNodeService;
pub use recorder::{CallRecord, CallRecorder, RecorderError, methods};
pub use types::{PodInfo, ServiceAccountTokens, TokenError, TokenRequest, TokenStatus};
