//! Step handler
//!
//! Runs each execution step of a run in its own Kubernetes Job. The engine
//! decides which steps to launch and how many may be in flight; the handler
//! only builds, polls and deletes the step jobs.

use crate::args::ExecuteStepArgs;
use crate::client::ClusterClient;
use crate::config::{LauncherConfig, StepHandlerConfig, WorkerInstance};
use crate::context::{ContainerContext, UserDefinedK8sConfig};
use crate::engine::{EngineEventData, RunEngine};
use crate::error::{Error, Result};
use crate::job::{
    literal_env, run_labels, WorkerComponent, WorkerJobConfig, OP_LABEL, RUN_JOB_NAME_ENV,
    RUN_STEP_KEY_ENV,
};
use crate::run::Run;
use crate::worker::{ClusterWorker, HealthCheckResult, StepWorker};
use futures::stream::{self, Stream, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// One step of a run's execution plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStep {
    pub key: String,
    pub tags: BTreeMap<String, String>,
}

impl ExecutionStep {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            tags: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// What the engine hands the step handler for one call
#[derive(Clone)]
pub struct StepHandlerContext {
    pub engine: Arc<dyn RunEngine>,
    pub run: Run,
    pub steps: Vec<ExecutionStep>,
    pub execute_step_args: ExecuteStepArgs,
}

impl StepHandlerContext {
    fn step(&self, step_key: &str) -> Result<&ExecutionStep> {
        self.steps
            .iter()
            .find(|step| step.key == step_key)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "Step {step_key} is not part of the execution plan of run {}",
                    self.run.run_id
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEventKind {
    /// The step's job was accepted by the cluster
    StepWorkerStarting,
}

/// Event produced while launching steps, for the engine to record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepEvent {
    pub kind: StepEventKind,
    pub step_key: String,
    pub message: String,
    pub data: EngineEventData,
}

pub struct StepHandler {
    client: Arc<dyn ClusterClient>,
    launcher_context: ContainerContext,
    instance: WorkerInstance,
    config: StepHandlerConfig,
}

impl StepHandler {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        launcher_config: &LauncherConfig,
        config: StepHandlerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            launcher_context: launcher_config.container_context.clone(),
            instance: launcher_config.instance.clone(),
            config,
        })
    }

    /// Limit on in-flight step workers. Enforced by the engine, not here.
    pub fn max_concurrent(&self) -> Option<usize> {
        self.config.max_concurrent
    }

    /// Effective container context of one step.
    ///
    /// Layers: launcher, step handler config, code location context, then
    /// the step's raw config tag. Run tags are not consulted.
    pub fn container_context_for_step(
        &self,
        ctx: &StepHandlerContext,
        step_key: &str,
    ) -> Result<ContainerContext> {
        let step = ctx.step(step_key)?;
        let base = self
            .launcher_context
            .clone()
            .merged(&self.config.container_context);

        let mut context = ContainerContext::create_for_run(&ctx.run, &base, false)?;

        let step_config = UserDefinedK8sConfig::from_tags(&step.tags)?;
        if !step_config.is_empty() {
            debug!(step_key = %step_key, "Applying raw Kubernetes config from step tags");
            context.merge(&ContainerContext::from_raw_config(step_config));
        }
        Ok(context)
    }

    /// Launch a job for every step in `ctx`.
    ///
    /// The stream is lazy: each job is submitted when its event is polled.
    pub fn launch_step<'a>(
        &'a self,
        ctx: &'a StepHandlerContext,
    ) -> impl Stream<Item = Result<StepEvent>> + 'a {
        stream::iter(ctx.execute_step_args.step_keys_to_execute.clone())
            .then(move |step_key| async move { self.launch_single_step(ctx, step_key).await })
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run.run_id))]
    pub async fn check_step_health(
        &self,
        ctx: &StepHandlerContext,
        step_key: &str,
    ) -> HealthCheckResult {
        let worker = match self.step_worker(ctx, step_key) {
            Ok(worker) => worker,
            Err(e) => return HealthCheckResult::unknown(e.to_string()),
        };
        worker.check_health(self.client.as_ref(), None).await
    }

    /// Delete the job of a step. Never fails; errors are reported as events.
    #[instrument(skip(self, ctx), fields(run_id = %ctx.run.run_id))]
    pub async fn terminate_step(&self, ctx: &StepHandlerContext, step_key: &str) -> bool {
        let worker = match self.step_worker(ctx, step_key) {
            Ok(worker) => worker,
            Err(e) => {
                error!(error = %e, "Cannot resolve step worker to terminate");
                return false;
            }
        };

        report(
            ctx,
            &format!(
                "Deleting Kubernetes job {} for step {step_key}",
                worker.job_name()
            ),
            EngineEventData::new(),
        )
        .await;

        match worker.delete_job(self.client.as_ref()).await {
            Ok(deleted) => {
                info!(job_name = %worker.job_name(), deleted, "Step worker deletion finished");
                deleted
            }
            Err(e) => {
                error!(job_name = %worker.job_name(), error = %e, "Failed to delete step worker");
                report(
                    ctx,
                    &format!(
                        "Step {step_key} was not terminated successfully; encountered error in delete_job"
                    ),
                    EngineEventData::engine_error(&e),
                )
                .await;
                false
            }
        }
    }

    fn step_worker(&self, ctx: &StepHandlerContext, step_key: &str) -> Result<StepWorker> {
        let context = self.container_context_for_step(ctx, step_key)?;
        Ok(StepWorker::new(
            &ctx.run.run_id,
            step_key,
            context.namespace(),
            ctx.execute_step_args.retry_attempt(step_key),
        ))
    }

    async fn launch_single_step(
        &self,
        ctx: &StepHandlerContext,
        step_key: String,
    ) -> Result<StepEvent> {
        let context = self.container_context_for_step(ctx, &step_key)?;
        let args = &ctx.execute_step_args;
        let origin = &args.job_origin;

        let image = context.resolve_image([
            self.config.container_context.image.as_deref(),
            origin.code_location.container_image.as_deref(),
        ])?;

        let worker = StepWorker::new(
            &ctx.run.run_id,
            &step_key,
            context.namespace(),
            args.retry_attempt(&step_key),
        );
        let job_name = worker.job_name().to_string();
        let namespace = worker.namespace().to_string();

        let mut labels = run_labels(&ctx.run);
        labels.insert(OP_LABEL.to_string(), step_key.clone());

        let job = WorkerJobConfig {
            job_name: job_name.clone(),
            pod_name: job_name.clone(),
            namespace: namespace.clone(),
            image,
            args: args.for_step(&step_key).command_args()?,
            component: WorkerComponent::StepWorker,
            labels,
            env: vec![
                literal_env(RUN_JOB_NAME_ENV, &origin.job_name),
                literal_env(RUN_STEP_KEY_ENV, &step_key),
            ],
            instance: self.instance.clone(),
            context,
        }
        .into_job()?;

        self.client.submit(job, &namespace).await.map_err(|e| {
            error!(
                job_name = %job_name,
                step_key = %step_key,
                error = %e,
                "Cluster rejected step worker job"
            );
            Error::Launch {
                job_name: job_name.clone(),
                message: e.to_string(),
            }
        })?;

        info!(job_name = %job_name, step_key = %step_key, "Launched step worker");
        Ok(StepEvent {
            kind: StepEventKind::StepWorkerStarting,
            message: format!("Executing step \"{step_key}\" in Kubernetes job {job_name}."),
            step_key,
            data: EngineEventData::new()
                .with_metadata("Kubernetes Job name", job_name)
                .with_metadata("Kubernetes Namespace", namespace),
        })
    }
}

async fn report(ctx: &StepHandlerContext, message: &str, data: EngineEventData) {
    if let Err(e) = ctx.engine.report_event(&ctx.run, message, data).await {
        warn!(error = %e, message = %message, "Failed to report step handler event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::KnownExecutionState;
    use crate::client::JobStatusCounts;
    use crate::run::{CodeLocationOrigin, JobOrigin, RunStatus, K8S_CONFIG_TAG};
    use crate::test_utils::{FakeClusterClient, RecordingEngine};
    use crate::worker::WorkerStatus;
    use futures::TryStreamExt;
    use serde_json::{json, Value};
    use serial_test::serial;

    const RUN_ID: &str = "abc";

    fn launcher_config() -> LauncherConfig {
        LauncherConfig::from_yaml(
            r#"
namespace: dagster
image: launcher-image:1
env_vars: [BAR_TEST]
"#,
        )
        .unwrap()
    }

    fn origin(container_context: Option<Value>) -> JobOrigin {
        JobOrigin {
            job_name: "bar".to_string(),
            code_location: CodeLocationOrigin {
                location_name: "repo".to_string(),
                container_image: None,
                container_context,
            },
        }
    }

    fn context(
        engine: Arc<RecordingEngine>,
        origin: JobOrigin,
        steps: Vec<ExecutionStep>,
    ) -> StepHandlerContext {
        let keys = steps.iter().map(|step| step.key.clone()).collect();
        StepHandlerContext {
            engine,
            run: Run::new(RUN_ID, origin.clone()).with_status(RunStatus::Started),
            steps,
            execute_step_args: ExecuteStepArgs {
                job_origin: origin,
                run_id: RUN_ID.to_string(),
                step_keys_to_execute: keys,
                known_state: None,
            },
        }
    }

    fn handler(client: Arc<FakeClusterClient>, config: StepHandlerConfig) -> StepHandler {
        StepHandler::new(client, &launcher_config(), config).unwrap()
    }

    fn container(job: &k8s_openapi::api::batch::v1::Job) -> Value {
        serde_json::to_value(job).unwrap()["spec"]["template"]["spec"]["containers"][0].clone()
    }

    fn env_names(container: &Value) -> Vec<String> {
        container["env"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|e| e["name"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    #[serial]
    async fn env_vars_union_across_all_layers() {
        std::env::set_var("FOO_TEST", "foo");
        std::env::set_var("BAR_TEST", "bar");
        std::env::set_var("BAZ_TEST", "baz");

        let client = Arc::new(FakeClusterClient::default());
        let config = StepHandlerConfig::from_yaml("env_vars: [FOO_TEST]\n").unwrap();
        let handler = handler(client.clone(), config);
        let ctx = context(
            Arc::new(RecordingEngine::default()),
            origin(Some(json!({"k8s": {"env_vars": ["BAZ_TEST"]}}))),
            vec![ExecutionStep::new("foo")],
        );

        let events: Vec<StepEvent> = handler.launch_step(&ctx).try_collect().await.unwrap();

        std::env::remove_var("FOO_TEST");
        std::env::remove_var("BAR_TEST");
        std::env::remove_var("BAZ_TEST");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, StepEventKind::StepWorkerStarting);
        assert_eq!(events[0].step_key, "foo");

        let (namespace, job) = &client.submitted_jobs()[0];
        assert_eq!(namespace, "dagster");
        let container = container(job);
        let names = env_names(&container);
        for expected in ["BAR_TEST", "FOO_TEST", "BAZ_TEST", "DAGSTER_RUN_STEP_KEY"] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(container["image"], "launcher-image:1");
        assert_eq!(container["args"][2], "execute_step");

        let labels = &serde_json::to_value(job).unwrap()["metadata"]["labels"];
        assert_eq!(labels["dagster/op"], "foo");
        assert_eq!(labels["app.kubernetes.io/component"], "step_worker");
    }

    #[tokio::test]
    async fn image_priority_for_steps() {
        let client = Arc::new(FakeClusterClient::default());
        let config = StepHandlerConfig::from_yaml("image: bizbuz\n").unwrap();
        let handler = handler(client.clone(), config);
        let ctx = context(
            Arc::new(RecordingEngine::default()),
            origin(None),
            vec![
                ExecutionStep::new("plain"),
                ExecutionStep::new("tagged").with_tag(
                    K8S_CONFIG_TAG,
                    r#"{"container_config": {"image": "new-image"}}"#,
                ),
            ],
        );

        let events: Vec<StepEvent> = handler.launch_step(&ctx).try_collect().await.unwrap();
        assert_eq!(events.len(), 2);

        let jobs = client.submitted_jobs();
        assert_eq!(container(&jobs[0].1)["image"], "bizbuz");
        assert_eq!(container(&jobs[1].1)["image"], "new-image");
    }

    #[tokio::test]
    async fn step_tags_deep_merge_with_code_location_config() {
        let client = Arc::new(FakeClusterClient::default());
        let handler = handler(client.clone(), StepHandlerConfig::default());
        let ctx = context(
            Arc::new(RecordingEngine::default()),
            origin(Some(json!({
                "k8s": {
                    "run_k8s_config": {
                        "container_config": {"resources": {"limits": {"cpu": "500m"}}}
                    }
                }
            }))),
            vec![ExecutionStep::new("foo").with_tag(
                K8S_CONFIG_TAG,
                r#"{"container_config": {"resources": {"limits": {"memory": "2560Mi"}}}}"#,
            )],
        );

        let context = handler.container_context_for_step(&ctx, "foo").unwrap();
        let limits = &context.run_k8s_config.container_config["resources"]["limits"];
        assert_eq!(limits["cpu"], "500m");
        assert_eq!(limits["memory"], "2560Mi");
    }

    #[tokio::test]
    async fn run_tags_do_not_reach_steps() {
        let client = Arc::new(FakeClusterClient::default());
        let handler = handler(client, StepHandlerConfig::default());
        let mut ctx = context(
            Arc::new(RecordingEngine::default()),
            origin(None),
            vec![ExecutionStep::new("foo")],
        );
        ctx.run = ctx.run.clone().with_tag(
            K8S_CONFIG_TAG,
            r#"{"container_config": {"image": "run-tag-image"}}"#,
        );

        let context = handler.container_context_for_step(&ctx, "foo").unwrap();
        assert!(context.run_k8s_config.is_empty());
    }

    #[tokio::test]
    async fn launch_is_lazy() {
        let client = Arc::new(FakeClusterClient::default());
        let handler = handler(client.clone(), StepHandlerConfig::default());
        let ctx = context(
            Arc::new(RecordingEngine::default()),
            origin(None),
            vec![ExecutionStep::new("a"), ExecutionStep::new("b")],
        );

        let mut events = Box::pin(handler.launch_step(&ctx));
        assert!(client.submitted_jobs().is_empty());

        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.step_key, "a");
        assert_eq!(client.submitted_jobs().len(), 1);
    }

    #[tokio::test]
    async fn retried_steps_get_attempt_suffix() {
        let client = Arc::new(FakeClusterClient::default());
        let handler = handler(client.clone(), StepHandlerConfig::default());
        let mut ctx = context(
            Arc::new(RecordingEngine::default()),
            origin(None),
            vec![ExecutionStep::new("foo")],
        );
        ctx.execute_step_args.known_state = Some(KnownExecutionState {
            previous_retry_attempts: BTreeMap::from([("foo".to_string(), 2)]),
        });

        let events: Vec<StepEvent> = handler.launch_step(&ctx).try_collect().await.unwrap();

        let job_name = events[0].data.metadata["Kubernetes Job name"].clone();
        assert!(job_name.starts_with("dagster-step-foo-"));
        assert!(job_name.ends_with("-2"));
    }

    #[tokio::test]
    async fn check_step_health_reports_failed_job() {
        let client = Arc::new(FakeClusterClient::default());
        let handler = handler(client.clone(), StepHandlerConfig::default());
        let ctx = context(
            Arc::new(RecordingEngine::default()),
            origin(None),
            vec![ExecutionStep::new("foo")],
        );
        let worker = handler.step_worker(&ctx, "foo").unwrap();

        assert_eq!(
            handler.check_step_health(&ctx, "foo").await.status,
            WorkerStatus::Running
        );

        client.set_status(
            worker.job_name(),
            JobStatusCounts {
                active: 0,
                failed: 1,
                succeeded: 0,
            },
        );
        let health = handler.check_step_health(&ctx, "foo").await;
        assert_eq!(health.status, WorkerStatus::Failed);
        assert_eq!(
            health.message,
            Some(format!(
                "Discovered failed Kubernetes job {} for step foo.",
                worker.job_name()
            ))
        );
    }

    #[tokio::test]
    async fn terminate_step_reports_and_deletes() {
        let client = Arc::new(FakeClusterClient::default());
        let engine = Arc::new(RecordingEngine::default());
        let handler = handler(client.clone(), StepHandlerConfig::default());
        let ctx = context(engine.clone(), origin(None), vec![ExecutionStep::new("foo")]);
        let job_name = handler.step_worker(&ctx, "foo").unwrap().job_name().to_string();

        assert!(handler.terminate_step(&ctx, "foo").await);

        assert_eq!(client.deleted_jobs(), vec![job_name.clone()]);
        assert_eq!(
            engine.messages(),
            vec![format!("Deleting Kubernetes job {job_name} for step foo")]
        );
    }

    #[tokio::test]
    async fn terminate_step_never_raises() {
        let client = Arc::new(FakeClusterClient {
            fail_delete: true,
            ..Default::default()
        });
        let engine = Arc::new(RecordingEngine::default());
        let handler = handler(client, StepHandlerConfig::default());
        let ctx = context(engine.clone(), origin(None), vec![ExecutionStep::new("foo")]);

        assert!(!handler.terminate_step(&ctx, "foo").await);
        assert!(!handler.terminate_step(&ctx, "not-in-plan").await);

        let events = engine.events();
        assert_eq!(events.len(), 2);
        assert!(events[1].2.error.is_some());
    }
}
