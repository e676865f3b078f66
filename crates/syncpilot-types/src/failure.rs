//! Failure reasons attached to attempts and jobs.
//!
//! A [`FailureReason`] says where a failure came from ([`FailureOrigin`]),
//! what kind it was ([`FailureType`]) and carries an internal message for
//! operators next to an external message suitable for users.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Component a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    Source,
    Destination,
    Replication,
    Platform,
    Unknown,
}

impl FailureOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Destination => "destination",
            Self::Replication => "replication",
            Self::Platform => "platform",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failure. Config errors are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Needs user intervention (bad credentials, bad settings).
    ConfigError,
    /// Infrastructure or platform fault.
    SystemError,
    /// The attempt was cancelled by a user.
    ManualCancellation,
    /// A fault expected to clear on its own.
    TransientError,
    /// A heartbeat from a running sync stopped arriving.
    HeartbeatTimeout,
    /// The destination did not respond in time.
    DestinationTimeout,
}

impl FailureType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigError => "config_error",
            Self::SystemError => "system_error",
            Self::ManualCancellation => "manual_cancellation",
            Self::TransientError => "transient_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::DestinationTimeout => "destination_timeout",
        }
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reason an attempt failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub failure_origin: FailureOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl FailureReason {
    /// A bare reason with only an origin and timestamp.
    #[must_use]
    pub fn new(failure_origin: FailureOrigin, timestamp: i64) -> Self {
        Self {
            failure_origin,
            failure_type: None,
            internal_message: None,
            external_message: None,
            stacktrace: None,
            retryable: None,
            timestamp,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_type(mut self, failure_type: FailureType) -> Self {
        self.failure_type = Some(failure_type);
        self
    }

    #[must_use]
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_external_message(mut self, message: impl Into<String>) -> Self {
        self.external_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this reason requires user intervention rather than a rerun.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        self.failure_type == Some(FailureType::ConfigError)
    }
}

/// Failures of one attempt plus whether it committed anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailureSummary {
    pub failures: Vec<FailureReason>,
    /// `None` when it could not be determined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_success: Option<bool>,
}
