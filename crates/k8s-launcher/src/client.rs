//! Cluster client
//!
//! [`ClusterClient`] is the seam between the launcher and the Kubernetes
//! API. [`KubeClusterClient`] is the production implementation.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerStatus, Event, Pod};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, ResourceExt};
use std::fmt::Write as _;
use tracing::{debug, info, instrument, warn};

const POD_LOG_TAIL_LINES: i64 = 25;

/// Pod counts reported by a Job's status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStatusCounts {
    pub active: i32,
    pub failed: i32,
    pub succeeded: i32,
}

/// Operations the launcher needs from the cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create `job` in `namespace`
    async fn submit(&self, job: Job, namespace: &str) -> Result<()>;

    /// Delete a job and its pods. Returns `false` if the job does not exist.
    async fn delete(&self, job_name: &str, namespace: &str) -> Result<bool>;

    async fn get_status(&self, job_name: &str, namespace: &str) -> Result<JobStatusCounts>;

    async fn list_pod_names(&self, job_name: &str, namespace: &str) -> Result<Vec<String>>;

    /// Human-readable status, recent logs and warning events of one pod
    async fn get_pod_diagnostics(
        &self,
        pod_name: &str,
        namespace: &str,
        container_name: &str,
    ) -> Result<String>;
}

/// [`ClusterClient`] backed by a `kube` client
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from launcher configuration.
    pub async fn from_config(config: &ClientConfig) -> Result<Self> {
        let kube_config = if config.load_incluster_config {
            if config.kubeconfig_file.is_some() {
                return Err(Error::Configuration(
                    "`kubeconfig_file` is set but `load_incluster_config` is true".to_string(),
                ));
            }
            debug!("Loading in-cluster Kubernetes configuration");
            kube::Config::incluster().map_err(|e| Error::ClientConfig(e.to_string()))?
        } else if let Some(path) = config.kubeconfig_file.as_deref() {
            debug!(path = %path, "Loading Kubernetes configuration from kubeconfig file");
            let kubeconfig =
                Kubeconfig::read_from(path).map_err(|e| Error::ClientConfig(e.to_string()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::ClientConfig(e.to_string()))?
        } else {
            debug!("Inferring Kubernetes configuration from environment");
            kube::Config::infer()
                .await
                .map_err(|e| Error::ClientConfig(e.to_string()))?
        };

        let client = Client::try_from(kube_config)?;
        Ok(Self::new(client))
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    #[instrument(skip(self, job), fields(job_name = ?job.metadata.name))]
    async fn submit(&self, job: Job, namespace: &str) -> Result<()> {
        self.jobs(namespace)
            .create(&PostParams::default(), &job)
            .await?;
        info!(namespace = %namespace, "Created worker job");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, job_name: &str, namespace: &str) -> Result<bool> {
        // Foreground propagation removes the job's pods along with it
        match self
            .jobs(namespace)
            .delete(job_name, &DeleteParams::foreground())
            .await
        {
            Ok(_) => {
                info!("Deleted worker job");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                info!("Worker job already gone");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_status(&self, job_name: &str, namespace: &str) -> Result<JobStatusCounts> {
        let job = self.jobs(namespace).get(job_name).await?;
        Ok(job
            .status
            .map(|status| JobStatusCounts {
                active: status.active.unwrap_or(0),
                failed: status.failed.unwrap_or(0),
                succeeded: status.succeeded.unwrap_or(0),
            })
            .unwrap_or_default())
    }

    async fn list_pod_names(&self, job_name: &str, namespace: &str) -> Result<Vec<String>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(&format!("job-name={job_name}")))
            .await?;
        Ok(pods.items.iter().map(ResourceExt::name_any).collect())
    }

    #[instrument(skip(self))]
    async fn get_pod_diagnostics(
        &self,
        pod_name: &str,
        namespace: &str,
        container_name: &str,
    ) -> Result<String> {
        let pods = self.pods(namespace);
        let pod = pods.get(pod_name).await?;

        let mut out = format!("Debug information for pod {pod_name}:\n\n");

        let status = pod.status.as_ref();
        let phase = status
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        let _ = writeln!(out, "Pod status: {phase}");

        let container_status = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| statuses.iter().find(|c| c.name == container_name));
        match container_status {
            Some(cs) => {
                let _ = writeln!(out, "{}", describe_container_status(cs));
            }
            None => {
                let _ = writeln!(out, "No status found for container '{container_name}'");
            }
        }

        let log_params = LogParams {
            container: Some(container_name.to_string()),
            tail_lines: Some(POD_LOG_TAIL_LINES),
            ..Default::default()
        };
        match pods.logs(pod_name, &log_params).await {
            Ok(logs) if logs.trim().is_empty() => {
                out.push_str("\nNo logs in pod.\n");
            }
            Ok(logs) => {
                let _ = write!(
                    out,
                    "\nLast {POD_LOG_TAIL_LINES} log lines:\n{}\n",
                    logs.trim_end()
                );
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch pod logs");
                let _ = writeln!(out, "\nFailure fetching pod logs: {e}");
            }
        }

        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        match events
            .list(&ListParams::default().fields(&format!("involvedObject.name={pod_name}")))
            .await
        {
            Ok(list) => {
                let warnings: Vec<String> = list
                    .items
                    .iter()
                    .filter(|event| event.type_.as_deref() == Some("Warning"))
                    .map(|event| {
                        format!(
                            "{}: {}",
                            event.reason.as_deref().unwrap_or("Unknown"),
                            event.message.as_deref().unwrap_or("")
                        )
                    })
                    .collect();
                if warnings.is_empty() {
                    out.push_str("\nNo warning events for pod.\n");
                } else {
                    let _ = write!(out, "\nWarning events for pod:\n{}\n", warnings.join("\n"));
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch pod events");
                let _ = writeln!(out, "\nFailure fetching pod events: {e}");
            }
        }

        Ok(out)
    }
}

fn describe_container_status(cs: &ContainerStatus) -> String {
    let name = &cs.name;
    let restarts = cs.restart_count;
    let Some(state) = cs.state.as_ref() else {
        return format!("Container '{name}' status: unknown (restarts: {restarts})");
    };

    if let Some(waiting) = state.waiting.as_ref() {
        let reason = waiting.reason.as_deref().unwrap_or("unknown");
        let message = waiting
            .message
            .as_deref()
            .map(|m| format!(": {m}"))
            .unwrap_or_default();
        format!("Container '{name}' status: Waiting ({reason}){message}")
    } else if let Some(terminated) = state.terminated.as_ref() {
        let reason = terminated.reason.as_deref().unwrap_or("unknown");
        let message = terminated
            .message
            .as_deref()
            .map(|m| format!(": {m}"))
            .unwrap_or_default();
        format!(
            "Container '{name}' status: Terminated with exit code {} ({reason}){message}",
            terminated.exit_code
        )
    } else if state.running.is_some() {
        format!("Container '{name}' status: Running (restarts: {restarts})")
    } else {
        format!("Container '{name}' status: unknown (restarts: {restarts})")
    }
}
