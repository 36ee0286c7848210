//! Worker Job construction
//!
//! [`WorkerJobConfig`] collects everything needed for one worker Job and is
//! consumed by [`WorkerJobConfig::into_job`]. The body is built as JSON,
//! raw overrides are deep-merged onto the matching sections, and the result
//! is converted into a typed [`Job`].

use crate::config::WorkerInstance;
use crate::context::{dedupe_env_keep_last, merge_onto, ContainerContext};
use crate::error::{Error, Result};
use crate::naming::ResourceNaming;
use crate::run::Run;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::EnvVar;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Default name of the worker container
pub const DEFAULT_CONTAINER_NAME: &str = "dagster";

/// Carries the name of the workflow job the worker executes
pub const RUN_JOB_NAME_ENV: &str = "DAGSTER_RUN_JOB_NAME";
pub const RUN_STEP_KEY_ENV: &str = "DAGSTER_RUN_STEP_KEY";
const DAGSTER_HOME_ENV: &str = "DAGSTER_HOME";
const PG_PASSWORD_ENV: &str = "DAGSTER_PG_PASSWORD";
const PG_PASSWORD_SECRET_KEY: &str = "postgresql-password";

const INSTANCE_VOLUME_NAME: &str = "dagster-instance";
const INSTANCE_CONFIG_FILE: &str = "dagster.yaml";

const JOB_BACKOFF_LIMIT: i32 = 0;
const JOB_TTL_SECONDS_AFTER_FINISHED: i64 = 86_400;

pub const JOB_LABEL: &str = "dagster/job";
pub const RUN_ID_LABEL: &str = "dagster/run-id";
pub const OP_LABEL: &str = "dagster/op";

/// Kind of worker a Job hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerComponent {
    RunWorker,
    StepWorker,
}

impl WorkerComponent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunWorker => "run_worker",
            Self::StepWorker => "step_worker",
        }
    }
}

impl fmt::Display for WorkerComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to build one worker Job
#[derive(Debug, Clone)]
pub struct WorkerJobConfig {
    pub job_name: String,
    pub pod_name: String,
    pub namespace: String,
    pub image: String,
    pub args: Vec<String>,
    pub component: WorkerComponent,
    /// Job-specific labels, applied above the standard and context labels
    pub labels: BTreeMap<String, String>,
    /// Job-specific env, applied above the context env
    pub env: Vec<EnvVar>,
    pub instance: WorkerInstance,
    pub context: ContainerContext,
}

impl WorkerJobConfig {
    /// Name of the container the worker process runs in
    pub fn container_name(&self) -> &str {
        self.context
            .run_k8s_config
            .container_name()
            .unwrap_or(DEFAULT_CONTAINER_NAME)
    }

    /// Build the Kubernetes Job
    pub fn into_job(self) -> Result<Job> {
        let labels = self.all_labels();
        let raw = &self.context.run_k8s_config;

        let mut container = self.container_spec()?;
        merge_onto(&mut container, &raw.container_config);

        let mut pod_spec = self.pod_spec(container)?;
        merge_onto(&mut pod_spec, &raw.pod_spec_config);

        let mut template_metadata = json!({
            "name": self.pod_name,
            "labels": labels
        });
        merge_onto(&mut template_metadata, &raw.pod_template_spec_metadata);

        let mut job_spec = json!({
            "backoffLimit": JOB_BACKOFF_LIMIT,
            "ttlSecondsAfterFinished": JOB_TTL_SECONDS_AFTER_FINISHED,
            "template": {
                "metadata": template_metadata,
                "spec": pod_spec
            }
        });
        merge_onto(&mut job_spec, &raw.job_spec_config);

        let mut job_metadata = json!({
            "name": self.job_name,
            "namespace": self.namespace,
            "labels": labels
        });
        merge_onto(&mut job_metadata, &raw.job_metadata);

        let mut job = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": job_metadata,
            "spec": job_spec
        });
        merge_onto(&mut job, &raw.job_config);

        serde_json::from_value(job).map_err(|e| {
            Error::Configuration(format!(
                "Worker job {} is not a valid Kubernetes Job after applying raw config: {e}",
                self.job_name
            ))
        })
    }

    fn all_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), "dagster".to_string()),
            ("app.kubernetes.io/instance".to_string(), "dagster".to_string()),
            ("app.kubernetes.io/part-of".to_string(), "dagster".to_string()),
            (
                "app.kubernetes.io/component".to_string(),
                self.component.to_string(),
            ),
        ]);
        labels.extend(self.context.labels.clone());
        labels.extend(self.labels.clone());

        labels
            .into_iter()
            .map(|(k, v)| (k, ResourceNaming::sanitize_label_value(&v)))
            .collect()
    }

    fn env(&self) -> Result<Vec<EnvVar>> {
        let mut env = vec![EnvVar {
            name: DAGSTER_HOME_ENV.to_string(),
            value: Some(self.instance.dagster_home.clone()),
            ..Default::default()
        }];

        if let Some(secret) = self.instance.postgres_password_secret.as_deref() {
            env.push(serde_json::from_value(json!({
                "name": PG_PASSWORD_ENV,
                "valueFrom": {"secretKeyRef": {"name": secret, "key": PG_PASSWORD_SECRET_KEY}}
            }))?);
        }

        env.extend(self.context.resolve_env_vars());
        env.extend(self.env.iter().cloned());
        Ok(dedupe_env_keep_last(env))
    }

    fn container_spec(&self) -> Result<Value> {
        let env_from: Vec<Value> = self
            .context
            .env_config_maps
            .iter()
            .map(|name| json!({"configMapRef": {"name": name}}))
            .chain(
                self.context
                    .env_secrets
                    .iter()
                    .map(|name| json!({"secretRef": {"name": name}})),
            )
            .collect();

        let mut volume_mounts = serde_json::to_value(&self.context.volume_mounts)?;
        if self.instance.instance_config_map.is_some() {
            if let Value::Array(mounts) = &mut volume_mounts {
                mounts.push(json!({
                    "name": INSTANCE_VOLUME_NAME,
                    "mountPath": format!("{}/{INSTANCE_CONFIG_FILE}", self.instance.dagster_home),
                    "subPath": INSTANCE_CONFIG_FILE
                }));
            }
        }

        let mut container = json!({
            "name": DEFAULT_CONTAINER_NAME,
            "image": self.image,
            "args": self.args,
            "env": serde_json::to_value(self.env()?)?,
            "envFrom": env_from,
            "volumeMounts": volume_mounts
        });

        if let Value::Object(map) = &mut container {
            if let Some(policy) = self.context.image_pull_policy.as_deref() {
                map.insert("imagePullPolicy".to_string(), json!(policy));
            }
            if !self.context.resources.is_empty() {
                map.insert(
                    "resources".to_string(),
                    serde_json::to_value(&self.context.resources)?,
                );
            }
            if let Some(security_context) = self.context.security_context.as_ref() {
                map.insert(
                    "securityContext".to_string(),
                    serde_json::to_value(security_context)?,
                );
            }
        }

        Ok(container)
    }

    fn pod_spec(&self, container: Value) -> Result<Value> {
        let mut volumes = serde_json::to_value(&self.context.volumes)?;
        if let (Some(config_map), Value::Array(list)) =
            (self.instance.instance_config_map.as_deref(), &mut volumes)
        {
            list.push(json!({
                "name": INSTANCE_VOLUME_NAME,
                "configMap": {"name": config_map}
            }));
        }

        let image_pull_secrets: Vec<Value> = self
            .context
            .image_pull_secrets
            .iter()
            .map(|name| json!({"name": name}))
            .collect();

        let mut pod_spec = json!({
            "restartPolicy": "Never",
            "imagePullSecrets": image_pull_secrets,
            "containers": [container],
            "volumes": volumes
        });

        if let Value::Object(map) = &mut pod_spec {
            if let Some(account) = self.context.service_account_name.as_deref() {
                map.insert("serviceAccountName".to_string(), json!(account));
            }
            if let Some(scheduler) = self.context.scheduler_name.as_deref() {
                map.insert("schedulerName".to_string(), json!(scheduler));
            }
        }

        Ok(pod_spec)
    }
}

/// Labels identifying the run a worker belongs to
pub fn run_labels(run: &Run) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(RUN_ID_LABEL.to_string(), run.run_id.clone())]);
    if let Some(job_name) = run.job_name() {
        labels.insert(JOB_LABEL.to_string(), job_name.to_string());
    }
    labels
}

pub(crate) fn literal_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}
