//! Worker handles
//!
//! A worker is one Kubernetes Job hosting a run or a single step. The
//! [`ClusterWorker`] trait carries the operations both kinds share: health
//! polling, deletion and diagnostics.

use crate::client::{ClusterClient, JobStatusCounts};
use crate::error::{Error, Result};
use crate::naming::ResourceNaming;
use crate::run::RunStatus;
use async_trait::async_trait;
use std::fmt;
use tracing::{debug, error, warn};

const NO_ACTIVE_PODS_MESSAGE: &str = "Run has not completed but K8s job has no active pods";
const RUN_JOB_FAILED_MESSAGE: &str = "K8s job failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Success,
    Failed,
    Unknown,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Outcome of one health poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub status: WorkerStatus,
    pub message: Option<String>,
}

impl HealthCheckResult {
    pub fn running() -> Self {
        Self {
            status: WorkerStatus::Running,
            message: None,
        }
    }

    pub fn success() -> Self {
        Self {
            status: WorkerStatus::Success,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Failed,
            message: Some(message.into()),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Unknown,
            message: Some(message.into()),
        }
    }
}

/// Classify a job from its pod counts.
///
/// Rules are checked in order. A run the engine still considers live whose
/// job has only finished pods means the worker died without reporting.
pub fn evaluate_job_health(
    counts: JobStatusCounts,
    run_status: Option<RunStatus>,
    failure_message: &str,
) -> HealthCheckResult {
    let inactive_with_finished_pods =
        counts.active == 0 && (counts.failed > 0 || counts.succeeded > 0);

    if matches!(run_status, Some(RunStatus::Started | RunStatus::Canceling))
        && inactive_with_finished_pods
    {
        return HealthCheckResult::failed(NO_ACTIVE_PODS_MESSAGE);
    }
    if counts.failed > 0 {
        return HealthCheckResult::failed(failure_message);
    }
    if counts.succeeded > 0 {
        return HealthCheckResult::success();
    }
    HealthCheckResult::running()
}

#[async_trait]
pub trait ClusterWorker: Send + Sync {
    fn job_name(&self) -> &str;

    fn namespace(&self) -> &str;

    /// Message reported when the job has failed pods
    fn failure_message(&self) -> String;

    /// Poll the job. Query errors become [`WorkerStatus::Unknown`].
    async fn check_health(
        &self,
        client: &dyn ClusterClient,
        run_status: Option<RunStatus>,
    ) -> HealthCheckResult {
        match client.get_status(self.job_name(), self.namespace()).await {
            Ok(counts) => {
                debug!(job_name = %self.job_name(), ?counts, "Polled worker job status");
                evaluate_job_health(counts, run_status, &self.failure_message())
            }
            Err(e) => {
                warn!(job_name = %self.job_name(), error = %e, "Failed to query worker job status");
                HealthCheckResult::unknown(
                    Error::HealthCheck {
                        job_name: self.job_name().to_string(),
                        message: e.to_string(),
                    }
                    .to_string(),
                )
            }
        }
    }

    /// Delete the job. `Ok(false)` means there was nothing to delete.
    async fn delete_job(&self, client: &dyn ClusterClient) -> Result<bool> {
        client
            .delete(self.job_name(), self.namespace())
            .await
            .map_err(|e| Error::Termination {
                job_name: self.job_name().to_string(),
                message: e.to_string(),
            })
    }

    /// Diagnostics for every pod of the job plus follow-up `kubectl` commands.
    ///
    /// Fetch failures are logged and never returned.
    async fn debug_info(&self, client: &dyn ClusterClient, container_name: &str) -> String {
        let job_name = self.job_name();
        let namespace = self.namespace();

        let pod_names = match client.list_pod_names(job_name, namespace).await {
            Ok(names) => names,
            Err(e) => {
                error!(job_name = %job_name, error = %e, "Error trying to list pods for k8s job");
                Vec::new()
            }
        };

        let mut sections = Vec::with_capacity(pod_names.len());
        for pod_name in &pod_names {
            match client
                .get_pod_diagnostics(pod_name, namespace, container_name)
                .await
            {
                Ok(info) => sections.push(info),
                Err(e) => {
                    error!(
                        job_name = %job_name,
                        pod_name = %pod_name,
                        error = %e,
                        "Error trying to get debug information for failed k8s job"
                    );
                }
            }
        }

        let mut message = sections.join("\n");
        match pod_names.first() {
            Some(pod) => message.push_str(&format!(
                "\nFor more information about the failure, try running `kubectl describe pod {pod}`, \
                 `kubectl logs {pod}`, or `kubectl describe job {job_name}` in your cluster."
            )),
            None => message.push_str(&format!(
                "\nFor more information about the failure, try running `kubectl describe job {job_name}` in your cluster."
            )),
        }
        message
    }
}

/// Job hosting a whole run
#[derive(Debug, Clone)]
pub struct RunWorker {
    job_name: String,
    namespace: String,
}

impl RunWorker {
    pub fn new(run_id: &str, namespace: impl Into<String>, resume_attempt: Option<u32>) -> Self {
        Self {
            job_name: ResourceNaming::run_job_name(run_id, resume_attempt),
            namespace: namespace.into(),
        }
    }
}

impl ClusterWorker for RunWorker {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn failure_message(&self) -> String {
        RUN_JOB_FAILED_MESSAGE.to_string()
    }
}

/// Job hosting a single step of a run
#[derive(Debug, Clone)]
pub struct StepWorker {
    step_key: String,
    job_name: String,
    namespace: String,
}

impl StepWorker {
    pub fn new(
        run_id: &str,
        step_key: &str,
        namespace: impl Into<String>,
        retry_attempt: Option<u32>,
    ) -> Self {
        Self {
            step_key: step_key.to_string(),
            job_name: ResourceNaming::step_job_name(run_id, step_key, retry_attempt),
            namespace: namespace.into(),
        }
    }

    pub fn step_key(&self) -> &str {
        &self.step_key
    }
}

impl ClusterWorker for StepWorker {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn failure_message(&self) -> String {
        format!(
            "Discovered failed Kubernetes job {} for step {}.",
            self.job_name, self.step_key
        )
    }
}
