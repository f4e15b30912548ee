//! Typed wrappers for the volume-context payloads the kubelet plumbs down.
//!
//! The kubelet passes service-account tokens and pod identity to a CSI driver
//! through well-known `csi.storage.k8s.io/*` volume-context keys. These types
//! build and parse those entries at the API boundary so the rest of the code
//! never handles the raw strings.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Volume-context key carrying the JSON-encoded service-account tokens.
pub const SERVICE_ACCOUNT_TOKENS_KEY: &str = "csi.storage.k8s.io/serviceAccount.tokens";
/// Volume-context key carrying the pod name.
pub const POD_NAME_KEY: &str = "csi.storage.k8s.io/pod.name";
/// Volume-context key carrying the pod namespace.
pub const POD_NAMESPACE_KEY: &str = "csi.storage.k8s.io/pod.namespace";
/// Volume-context key carrying the pod UID.
pub const POD_UID_KEY: &str = "csi.storage.k8s.io/pod.uid";
/// Volume-context key carrying the pod's service account name.
pub const SERVICE_ACCOUNT_NAME_KEY: &str = "csi.storage.k8s.io/serviceAccount.name";
/// Volume-context key marking inline ephemeral volumes.
pub const EPHEMERAL_KEY: &str = "csi.storage.k8s.io/ephemeral";

/// Token lifetime used when a request leaves `expiration_seconds` unset.
pub const DEFAULT_TOKEN_EXPIRATION_SECONDS: i64 = 3600;

// ============================================================================
// TokenRequest
// ============================================================================

/// A service-account token requested by a driver registration.
///
/// An empty or missing audience means the API server's default audience.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_seconds: Option<i64>,
}

impl TokenRequest {
    /// Request a token for the default audience with the given lifetime.
    pub fn with_expiration(expiration_seconds: i64) -> Self {
        Self {
            audience: None,
            expiration_seconds: Some(expiration_seconds),
        }
    }

    /// Audience key used in the token map.
    pub fn audience_key(&self) -> &str {
        self.audience.as_deref().unwrap_or("")
    }

    /// Lifetime to mint the token with.
    pub fn effective_expiration_seconds(&self) -> i64 {
        self.expiration_seconds
            .unwrap_or(DEFAULT_TOKEN_EXPIRATION_SECONDS)
    }
}

// ============================================================================
// ServiceAccountTokens
// ============================================================================

/// A minted token and its expiration, as serialized by the kubelet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expiration_timestamp: OffsetDateTime,
}

/// Audience to token map stored under [`SERVICE_ACCOUNT_TOKENS_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceAccountTokens(pub BTreeMap<String, TokenStatus>);

impl ServiceAccountTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, audience: impl Into<String>, status: TokenStatus) {
        self.0.insert(audience.into(), status);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TokenStatus)> {
        self.0.iter()
    }

    /// Parse the raw volume-context value.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let tokens: Self = serde_json::from_str(raw)?;
        if tokens.is_empty() {
            return Err(TokenError::Empty);
        }
        Ok(tokens)
    }

    /// Encode for the volume context.
    pub fn encode(&self) -> Result<String, TokenError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error returned when a token payload cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("token payload contains no audiences")]
    Empty,
}

/// Extract the credential from a volume context.
///
/// An empty value is treated as absent.
pub fn credential_from_context(volume_context: &HashMap<String, String>) -> Option<String> {
    volume_context
        .get(SERVICE_ACCOUNT_TOKENS_KEY)
        .filter(|v| !v.is_empty())
        .cloned()
}

// ============================================================================
// PodInfo
// ============================================================================

/// Pod identity passed to drivers registered with `podInfoOnMount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub service_account: String,
}

impl PodInfo {
    /// Volume-context entries for this pod. Persistent volumes only, so
    /// `ephemeral` is always `"false"`.
    pub fn volume_context_entries(&self) -> [(&'static str, String); 5] {
        [
            (POD_NAME_KEY, self.name.clone()),
            (POD_NAMESPACE_KEY, self.namespace.clone()),
            (POD_UID_KEY, self.uid.clone()),
            (SERVICE_ACCOUNT_NAME_KEY, self.service_account.clone()),
            (EPHEMERAL_KEY, "false".to_string()),
        ]
    }
}

impl Display for PodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.uid)
    }
}
