//! Call log verification.
//!
//! [`verify`] turns a frozen call log and an [`ExpectedShape`] into a single
//! verdict. Call counts are checked as lower bounds only: how many times an
//! orchestrator republishes depends on its timing and is never pinned.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::{self, Display};
use std::time::Duration;

use serde::Serialize;

use csi_mock::{CallRecord, PodInfo, ServiceAccountTokens, methods};

/// Default slack between a token's remaining lifetime and the requested one.
pub const DEFAULT_EXPIRATION_TOLERANCE: Duration = Duration::from_secs(5);

/// How strictly token expiration metadata is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationCheck {
    /// Ignore expiration metadata
    Off,
    /// Remaining lifetime at call time must be within `tolerance` of the request.
    ///
    /// Assumes the orchestrator mints a fresh token for every publish, as the
    /// kubelet does for drivers that require republish. A token reused across
    /// publishes ages between calls and fails this check once it is older than
    /// `tolerance`; use [`ExpirationCheck::Off`] for such orchestrators.
    Strict { tolerance: Duration },
}

impl Default for ExpirationCheck {
    fn default() -> Self {
        ExpirationCheck::Strict {
            tolerance: DEFAULT_EXPIRATION_TOLERANCE,
        }
    }
}

/// What a correct call log looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedShape {
    /// Lower bound on NodePublishVolume calls
    pub min_calls: usize,
    /// Every publish must carry a credential (true) or none may (false)
    pub credential_expected: bool,
    pub expiration_seconds: Option<i64>,
    pub expiration_check: ExpirationCheck,
    /// A NodeStageVolume must precede the first publish (true) or never appear (false)
    pub expect_staging: bool,
    pub expect_unpublish: bool,
    pub expected_pod_info: Option<PodInfo>,
}

impl ExpectedShape {
    pub fn with_pod_info(mut self, pod_info: PodInfo) -> Self {
        self.expected_pod_info = Some(pod_info);
        self
    }
}

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    InsufficientCalls,
    MissingUnpublish,
    UnexpectedCredential,
    CredentialExpirationMismatch,
    MissingPodInfo,
    StagingMismatch,
    /// A volume was published again after it was unpublished
    PublishAfterUnpublish,
    /// The log itself is inconsistent; indicates a locking bug
    RecorderCorruption,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InsufficientCalls => "InsufficientCalls",
            FailureKind::MissingUnpublish => "MissingUnpublish",
            FailureKind::UnexpectedCredential => "UnexpectedCredential",
            FailureKind::CredentialExpirationMismatch => "CredentialExpirationMismatch",
            FailureKind::MissingPodInfo => "MissingPodInfo",
            FailureKind::StagingMismatch => "StagingMismatch",
            FailureKind::PublishAfterUnpublish => "PublishAfterUnpublish",
            FailureKind::RecorderCorruption => "RecorderCorruption",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct FailureReport {
    pub kind: FailureKind,
    pub detail: String,
}

impl FailureReport {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Counts from a passing call log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    pub publish_calls: usize,
    pub unpublish_calls: usize,
    pub stage_calls: usize,
    pub credentialed_calls: usize,
    pub volume_ids: BTreeSet<String>,
}

impl CallSummary {
    fn from_log(log: &[CallRecord]) -> Self {
        let mut summary = Self::default();
        for record in log {
            match record.method.as_str() {
                methods::NODE_PUBLISH_VOLUME => {
                    summary.publish_calls += 1;
                    if record.has_credential() {
                        summary.credentialed_calls += 1;
                    }
                    summary.volume_ids.insert(record.volume_id.clone());
                }
                methods::NODE_UNPUBLISH_VOLUME => summary.unpublish_calls += 1,
                methods::NODE_STAGE_VOLUME => summary.stage_calls += 1,
                _ => {}
            }
        }
        summary
    }
}

/// Check a call log against the expected shape. The first failure wins.
pub fn verify(log: &[CallRecord], expected: &ExpectedShape) -> Result<CallSummary, FailureReport> {
    check_sequence(log)?;

    let summary = CallSummary::from_log(log);

    // Republish means repeated calls for the same volume, not calls spread
    // over several volumes
    let mut per_volume: BTreeMap<&str, usize> = BTreeMap::new();
    for record in log.iter().filter(|r| r.method == methods::NODE_PUBLISH_VOLUME) {
        *per_volume.entry(record.volume_id.as_str()).or_default() += 1;
    }
    let busiest = per_volume.values().copied().max().unwrap_or(0);
    if busiest < expected.min_calls {
        return Err(FailureReport::new(
            FailureKind::InsufficientCalls,
            format!(
                "NodePublishVolume should be called at least {} times for one volume, got {} ({} in total over {} volume(s))",
                expected.min_calls,
                busiest,
                summary.publish_calls,
                per_volume.len()
            ),
        ));
    }

    if expected.expect_unpublish && summary.unpublish_calls == 0 {
        return Err(FailureReport::new(
            FailureKind::MissingUnpublish,
            "NodeUnpublishVolume was never called",
        ));
    }

    check_lifecycle(log)?;

    let publishes: Vec<&CallRecord> = log
        .iter()
        .filter(|r| r.method == methods::NODE_PUBLISH_VOLUME)
        .collect();

    for record in &publishes {
        check_credential(record, expected)?;
    }

    if let Some(pod) = &expected.expected_pod_info {
        for record in &publishes {
            check_pod_info(record, pod)?;
        }
    }

    check_staging(log, expected.expect_staging)?;

    Ok(summary)
}

fn check_sequence(log: &[CallRecord]) -> Result<(), FailureReport> {
    for (index, record) in log.iter().enumerate() {
        if record.seq != index as u64 {
            return Err(FailureReport::new(
                FailureKind::RecorderCorruption,
                format!(
                    "record at position {} has sequence number {}",
                    index, record.seq
                ),
            ));
        }
    }
    Ok(())
}

fn check_lifecycle(log: &[CallRecord]) -> Result<(), FailureReport> {
    let mut unpublished = HashSet::new();
    for record in log {
        match record.method.as_str() {
            methods::NODE_UNPUBLISH_VOLUME => {
                unpublished.insert(record.volume_id.as_str());
            }
            methods::NODE_PUBLISH_VOLUME if unpublished.contains(record.volume_id.as_str()) => {
                return Err(FailureReport::new(
                    FailureKind::PublishAfterUnpublish,
                    format!(
                        "call #{} published volume {} after it was unpublished",
                        record.seq, record.volume_id
                    ),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_credential(record: &CallRecord, expected: &ExpectedShape) -> Result<(), FailureReport> {
    let credential = match (&record.credential, expected.credential_expected) {
        (None, false) => return Ok(()),
        (Some(_), false) => {
            return Err(FailureReport::new(
                FailureKind::UnexpectedCredential,
                format!(
                    "call #{} for volume {} carried a service account token, none expected",
                    record.seq, record.volume_id
                ),
            ));
        }
        (None, true) => {
            return Err(FailureReport::new(
                FailureKind::UnexpectedCredential,
                format!(
                    "call #{} for volume {} carried no service account token",
                    record.seq, record.volume_id
                ),
            ));
        }
        (Some(credential), true) => credential,
    };

    let tokens = ServiceAccountTokens::parse(credential).map_err(|e| {
        FailureReport::new(
            FailureKind::UnexpectedCredential,
            format!("call #{}: {}", record.seq, e),
        )
    })?;

    let (Some(expected_seconds), ExpirationCheck::Strict { tolerance }) =
        (expected.expiration_seconds, expected.expiration_check)
    else {
        return Ok(());
    };

    for (audience, status) in tokens.iter() {
        let remaining = (status.expiration_timestamp - record.observed_at).whole_seconds();
        let drift = (remaining - expected_seconds).unsigned_abs();
        if drift > tolerance.as_secs() {
            return Err(FailureReport::new(
                FailureKind::CredentialExpirationMismatch,
                format!(
                    "call #{}: token for audience '{}' expires in {}s, expected {}s",
                    record.seq, audience, remaining, expected_seconds
                ),
            ));
        }
    }

    Ok(())
}

fn check_pod_info(record: &CallRecord, pod: &PodInfo) -> Result<(), FailureReport> {
    for (key, value) in pod.volume_context_entries() {
        match record.volume_context.get(key) {
            Some(found) if *found == value => {}
            found => {
                return Err(FailureReport::new(
                    FailureKind::MissingPodInfo,
                    format!(
                        "call #{}: {} is {:?}, expected {:?}",
                        record.seq, key, found, value
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn check_staging(log: &[CallRecord], expect_staging: bool) -> Result<(), FailureReport> {
    let first_stage = log.iter().position(|r| r.method == methods::NODE_STAGE_VOLUME);
    let first_publish = log
        .iter()
        .position(|r| r.method == methods::NODE_PUBLISH_VOLUME);

    match (expect_staging, first_stage, first_publish) {
        (false, None, _) => Ok(()),
        (false, Some(at), _) => Err(FailureReport::new(
            FailureKind::StagingMismatch,
            format!("unexpected NodeStageVolume at call #{}", at),
        )),
        (true, Some(stage), Some(publish)) if stage < publish => Ok(()),
        (true, Some(_), None) => Ok(()),
        (true, _, _) => Err(FailureReport::new(
            FailureKind::StagingMismatch,
            "NodeStageVolume did not precede the first NodePublishVolume",
        )),
    }
}
