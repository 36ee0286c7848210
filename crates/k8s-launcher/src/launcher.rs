//! Run launcher
//!
//! Launches one Kubernetes Job per run. Resumed runs get a fresh job whose
//! name carries the resume attempt, so terminate, health and debug calls
//! always address the job of the current attempt.

use crate::args::ExecuteRunArgs;
use crate::client::{ClusterClient, KubeClusterClient};
use crate::config::LauncherConfig;
use crate::context::ContainerContext;
use crate::engine::{EngineEventData, RunEngine};
use crate::error::{Error, Result};
use crate::job::{
    literal_env, run_labels, WorkerComponent, WorkerJobConfig, DEFAULT_CONTAINER_NAME,
    RUN_JOB_NAME_ENV,
};
use crate::naming::ResourceNaming;
use crate::run::{Run, RunStatus, DOCKER_IMAGE_TAG};
use crate::worker::{ClusterWorker, HealthCheckResult, RunWorker};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Launches and manages run worker jobs
pub struct K8sRunLauncher {
    client: Arc<dyn ClusterClient>,
    engine: Arc<dyn RunEngine>,
    config: LauncherConfig,
}

impl K8sRunLauncher {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        engine: Arc<dyn RunEngine>,
        config: LauncherConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            engine,
            config,
        })
    }

    /// Build a launcher talking to the cluster described by `config`.
    pub async fn from_config(engine: Arc<dyn RunEngine>, config: LauncherConfig) -> Result<Self> {
        let client = KubeClusterClient::from_config(&config.client).await?;
        Self::new(Arc::new(client), engine, config)
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Effective container context of a run: launcher config, then the
    /// code location's context, then the run's raw config tag.
    pub fn container_context_for_run(&self, run: &Run) -> Result<ContainerContext> {
        ContainerContext::create_for_run(run, &self.config.container_context, true)
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    pub async fn launch_run(&self, run: &Run) -> Result<()> {
        let args = self.execute_run_args(run)?.command_args()?;
        self.launch_worker(run, args, None).await
    }

    /// Launch a new worker for a run whose previous worker was lost.
    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    pub async fn resume_run(&self, run: &Run, attempt_number: u32) -> Result<()> {
        let args = self.execute_run_args(run)?.resume_command_args()?;
        self.launch_worker(run, args, Some(attempt_number)).await
    }

    /// Whether `terminate` would act on this run
    pub async fn can_terminate(&self, run_id: &str) -> Result<bool> {
        Ok(self
            .engine
            .get_run_by_id(run_id)
            .await?
            .is_some_and(|run| run.status == RunStatus::Started))
    }

    /// Stop a run by deleting the job of its current attempt.
    ///
    /// Cluster errors are reported as an engine event and yield `false`.
    #[instrument(skip(self))]
    pub async fn terminate(&self, run_id: &str) -> Result<bool> {
        let Some(run) = self.engine.get_run_by_id(run_id).await? else {
            warn!("Cannot terminate unknown run");
            return Ok(false);
        };

        if !self.can_terminate(run_id).await? {
            self.engine
                .report_event(
                    &run,
                    "Unable to terminate run; can_terminate returned false",
                    EngineEventData::new(),
                )
                .await?;
            return Ok(false);
        }

        let context = match self.container_context_for_run(&run) {
            Ok(context) => context,
            Err(e) => {
                error!(error = %e, "Cannot resolve container context of run to terminate");
                self.engine
                    .report_event(
                        &run,
                        "Run was not terminated successfully; encountered error resolving container context",
                        EngineEventData::engine_error(&e),
                    )
                    .await?;
                return Ok(false);
            }
        };
        let attempt = self.engine.count_resume_run_attempts(run_id).await?;
        let worker = RunWorker::new(run_id, context.namespace(), Some(attempt));

        self.engine.report_run_canceling(&run).await?;

        match worker.delete_job(self.client.as_ref()).await {
            Ok(true) => {
                info!(job_name = %worker.job_name(), "Terminated run worker");
                self.engine
                    .report_event(&run, "Run was terminated successfully.", EngineEventData::new())
                    .await?;
                Ok(true)
            }
            Ok(false) => {
                self.engine
                    .report_event(
                        &run,
                        "Run was not terminated successfully; delete_job returned false",
                        EngineEventData::new(),
                    )
                    .await?;
                Ok(false)
            }
            Err(e) => {
                error!(job_name = %worker.job_name(), error = %e, "Failed to terminate run worker");
                self.engine
                    .report_event(
                        &run,
                        "Run was not terminated successfully; encountered error in delete_job",
                        EngineEventData::engine_error(&e),
                    )
                    .await?;
                Ok(false)
            }
        }
    }

    /// Poll the job of the run's current attempt. Never fails.
    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    pub async fn check_run_worker_health(&self, run: &Run) -> HealthCheckResult {
        let worker = match self.current_worker(run).await {
            Ok(worker) => worker,
            Err(e) => return HealthCheckResult::unknown(e.to_string()),
        };
        worker
            .check_health(self.client.as_ref(), Some(run.status))
            .await
    }

    /// Diagnostics for the pods of the run's current job. Never fails.
    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    pub async fn get_run_worker_debug_info(&self, run: &Run) -> String {
        let context = self.container_context_for_run(run).unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to launcher container context for debug info");
            self.config.container_context.clone()
        });
        let attempt = self
            .engine
            .count_resume_run_attempts(&run.run_id)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to count resume attempts for debug info");
                0
            });

        let container_name = context
            .run_k8s_config
            .container_name()
            .unwrap_or(DEFAULT_CONTAINER_NAME);
        RunWorker::new(&run.run_id, context.namespace(), Some(attempt))
            .debug_info(self.client.as_ref(), container_name)
            .await
    }

    async fn current_worker(&self, run: &Run) -> Result<RunWorker> {
        let context = self.container_context_for_run(run)?;
        let attempt = self.engine.count_resume_run_attempts(&run.run_id).await?;
        Ok(RunWorker::new(&run.run_id, context.namespace(), Some(attempt)))
    }

    fn execute_run_args(&self, run: &Run) -> Result<ExecuteRunArgs> {
        let job_origin = run.job_origin.clone().ok_or_else(|| {
            Error::Configuration(format!("Run {} has no job origin to launch", run.run_id))
        })?;
        Ok(ExecuteRunArgs {
            job_origin,
            run_id: run.run_id.clone(),
            set_exit_code_on_failure: self.config.fail_pod_on_run_failure.filter(|fail| *fail),
        })
    }

    async fn launch_worker(
        &self,
        run: &Run,
        args: Vec<String>,
        resume_attempt: Option<u32>,
    ) -> Result<()> {
        let context = self.container_context_for_run(run)?;
        let origin = run.job_origin.as_ref().ok_or_else(|| {
            Error::Configuration(format!("Run {} has no job origin to launch", run.run_id))
        })?;
        let image = context.resolve_image([origin.code_location.container_image.as_deref()])?;

        let job_name = ResourceNaming::run_job_name(&run.run_id, resume_attempt);
        let namespace = context.namespace().to_string();

        let job = WorkerJobConfig {
            job_name: job_name.clone(),
            pod_name: job_name.clone(),
            namespace: namespace.clone(),
            image: image.clone(),
            args,
            component: WorkerComponent::RunWorker,
            labels: run_labels(run),
            env: vec![literal_env(RUN_JOB_NAME_ENV, &origin.job_name)],
            instance: self.config.instance.clone(),
            context,
        }
        .into_job()?;

        self.engine
            .add_run_tags(
                &run.run_id,
                BTreeMap::from([(DOCKER_IMAGE_TAG.to_string(), image)]),
            )
            .await?;

        self.engine
            .report_event(
                run,
                "Creating Kubernetes run worker job",
                EngineEventData::new()
                    .with_metadata("Kubernetes Job name", &job_name)
                    .with_metadata("Kubernetes Namespace", &namespace)
                    .with_metadata("Run ID", &run.run_id),
            )
            .await?;

        self.client.submit(job, &namespace).await.map_err(|e| {
            error!(job_name = %job_name, error = %e, "Cluster rejected run worker job");
            Error::Launch {
                job_name: job_name.clone(),
                message: e.to_string(),
            }
        })?;

        info!(job_name = %job_name, namespace = %namespace, "Launched run worker");
        self.engine
            .report_event(run, "Kubernetes run worker job created", EngineEventData::new())
            .await
    }
}
