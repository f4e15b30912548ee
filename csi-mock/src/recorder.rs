//! Append-only log of calls received by the mock driver.
//!
//! A [`CallRecorder`] is a cheap cloneable handle: the driver appends through
//! one clone while the scenario runner snapshots through another. The log is
//! guarded by a plain mutex because no critical section awaits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tonic::Status;
use tracing::{debug, warn};

use crate::types::credential_from_context;

/// Method names as they appear in the call log.
pub mod methods {
    pub const NODE_STAGE_VOLUME: &str = "NodeStageVolume";
    pub const NODE_UNSTAGE_VOLUME: &str = "NodeUnstageVolume";
    pub const NODE_PUBLISH_VOLUME: &str = "NodePublishVolume";
    pub const NODE_UNPUBLISH_VOLUME: &str = "NodeUnpublishVolume";
    pub const NODE_GET_INFO: &str = "NodeGetInfo";
    pub const NODE_GET_CAPABILITIES: &str = "NodeGetCapabilities";
    pub const GET_PLUGIN_INFO: &str = "GetPluginInfo";
    pub const GET_PLUGIN_CAPABILITIES: &str = "GetPluginCapabilities";
    pub const PROBE: &str = "Probe";
}

/// One observed plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    /// Arrival position in the log, assigned by the recorder.
    pub seq: u64,
    pub method: String,
    pub volume_id: String,
    /// Raw service-account token payload, if the call carried one.
    pub credential: Option<String>,
    pub volume_context: BTreeMap<String, String>,
    /// Error returned to the caller, if any.
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

impl CallRecord {
    pub fn new(method: &str, volume_id: impl Into<String>) -> Self {
        Self {
            seq: 0,
            method: method.to_string(),
            volume_id: volume_id.into(),
            credential: None,
            volume_context: BTreeMap::new(),
            error: None,
            observed_at: OffsetDateTime::now_utc(),
        }
    }

    /// Attach the volume context, lifting the credential out of it.
    pub fn with_volume_context(mut self, volume_context: &HashMap<String, String>) -> Self {
        self.credential = credential_from_context(volume_context);
        self.volume_context = volume_context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self
    }

    pub fn with_error(mut self, status: &Status) -> Self {
        self.error = Some(format!("{:?}: {}", status.code(), status.message()));
        self
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    /// Copy of the record safe to write to logs.
    fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.credential.is_some() {
            copy.credential = Some("<redacted>".to_string());
        }
        for (key, value) in copy.volume_context.iter_mut() {
            if key == crate::types::SERVICE_ACCOUNT_TOKENS_KEY {
                *value = "<redacted>".to_string();
            }
        }
        copy
    }
}

/// Error type for recorder operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RecorderError {
    #[error("call log lock poisoned")]
    Poisoned,
    #[error("call log is sealed, rejected {method} call")]
    Sealed { method: String },
}

#[derive(Debug, Default)]
struct CallLog {
    records: Vec<CallRecord>,
    sealed: bool,
    rejected: u64,
}

/// Shared handle to a call log.
#[derive(Debug, Clone, Default)]
pub struct CallRecorder {
    inner: Arc<Mutex<CallLog>>,
}

impl CallRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, CallLog>, RecorderError> {
        self.inner.lock().map_err(|_| RecorderError::Poisoned)
    }

    /// Append a record, assigning its sequence number.
    ///
    /// Returns the assigned sequence number.
    pub fn append(&self, mut record: CallRecord) -> Result<u64, RecorderError> {
        let mut log = self.lock()?;

        if log.sealed {
            log.rejected += 1;
            warn!(method = %record.method, volume_id = %record.volume_id, "Call arrived after log was sealed");
            return Err(RecorderError::Sealed {
                method: record.method,
            });
        }

        let seq = log.records.len() as u64;
        record.seq = seq;

        match serde_json::to_string(&record.redacted()) {
            Ok(json) => debug!(call = %json, "gRPCCall"),
            Err(e) => debug!(error = %e, seq, method = %record.method, "gRPCCall (unserializable)"),
        }

        log.records.push(record);
        Ok(seq)
    }

    /// Copy of the log in arrival order.
    pub fn snapshot(&self) -> Result<Vec<CallRecord>, RecorderError> {
        Ok(self.lock()?.records.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|log| log.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze the log. Later appends are rejected and counted.
    pub fn seal(&self) -> Result<(), RecorderError> {
        self.lock()?.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().map(|log| log.sealed).unwrap_or(true)
    }

    /// Number of appends rejected after sealing.
    pub fn rejected_count(&self) -> u64 {
        self.lock().map(|log| log.rejected).unwrap_or(0)
    }

    /// Drop every record and leave the log sealed. Recovers a poisoned log.
    ///
    /// A call still in flight when its scenario is torn down finds the log
    /// sealed and is rejected instead of refilling it.
    pub fn reset(&self) {
        let mut log = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *log = CallLog {
            sealed: true,
            ..CallLog::default()
        };
        self.inner.clear_poison();
    }

    /// Poison the log lock by panicking while holding it.
    #[cfg(any(test, feature = "test-util"))]
    pub fn poison(&self) {
        let inner = self.inner.clone();
        let _ = std::thread::spawn(move || {
            let _guard = inner.lock();
            panic!("call log lock poisoned");
        })
        .join();
    }
}
