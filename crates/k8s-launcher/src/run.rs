//! Run records as seen by the launcher.
//!
//! Runs are created by the orchestration engine before launch. The launcher
//! only reads them; status transitions are reported back through
//! [`crate::engine::RunEngine`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Run tag recording the image the worker job was launched with
pub const DOCKER_IMAGE_TAG: &str = "dagster/image";

/// Run or step tag carrying a raw Kubernetes config override as JSON
pub const K8S_CONFIG_TAG: &str = "dagster-k8s/config";

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    NotStarted,
    Starting,
    Started,
    Canceling,
    Canceled,
    Failure,
    Success,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Canceled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
            Self::Failure => "FAILURE",
            Self::Success => "SUCCESS",
        };
        f.write_str(s)
    }
}

/// Code location a job was loaded from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeLocationOrigin {
    pub location_name: String,

    /// Image the code location itself runs in, preferred over the launcher default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    /// Raw container context attached to the code location (`{"k8s": {...}}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_context: Option<serde_json::Value>,
}

/// Where the job of a run comes from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOrigin {
    pub job_name: String,
    pub code_location: CodeLocationOrigin,
}

/// One end-to-end execution of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub job_origin: Option<JobOrigin>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Run {
    pub fn new(run_id: impl Into<String>, job_origin: JobOrigin) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::NotStarted,
            job_origin: Some(job_origin),
            tags: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Job name of the origin, if the run has one
    pub fn job_name(&self) -> Option<&str> {
        self.job_origin.as_ref().map(|origin| origin.job_name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failure.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(!RunStatus::Started.is_terminal());
        assert!(!RunStatus::Canceling.is_terminal());
    }

    #[test]
    fn status_serializes_in_engine_form() {
        let json = serde_json::to_string(&RunStatus::NotStarted).unwrap();
        assert_eq!(json, "\"NOT_STARTED\"");
        assert_eq!(RunStatus::Canceling.to_string(), "CANCELING");
    }
}
