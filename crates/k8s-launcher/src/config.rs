//! Launcher configuration
//!
//! Configuration is read from a mounted YAML file. Container-level options
//! (image, namespace, env, resources, volumes, ...) are flattened into the
//! top level and become the lowest-precedence layer of every resolved
//! [`ContainerContext`].

use crate::context::ContainerContext;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

const VALID_PULL_POLICIES: &[&str] = &["Always", "IfNotPresent", "Never"];
const MAX_NAMESPACE_LENGTH: usize = 63;

/// How the Kubernetes client is constructed
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Use the service account of the pod the launcher runs in
    #[serde(default = "default_load_incluster_config")]
    pub load_incluster_config: bool,

    /// Kubeconfig to load when not running in-cluster
    #[serde(default)]
    pub kubeconfig_file: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            load_incluster_config: default_load_incluster_config(),
            kubeconfig_file: None,
        }
    }
}

fn default_load_incluster_config() -> bool {
    true
}

/// Instance settings every worker needs to reach the engine's storage
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerInstance {
    /// Home directory of the engine inside the worker container
    #[serde(default = "default_dagster_home")]
    pub dagster_home: String,

    /// ConfigMap holding the instance configuration, mounted into the worker home
    #[serde(default)]
    pub instance_config_map: Option<String>,

    /// Secret holding the storage password, exposed as `DAGSTER_PG_PASSWORD`
    #[serde(default)]
    pub postgres_password_secret: Option<String>,
}

impl Default for WorkerInstance {
    fn default() -> Self {
        Self {
            dagster_home: default_dagster_home(),
            instance_config_map: None,
            postgres_password_secret: None,
        }
    }
}

fn default_dagster_home() -> String {
    "/opt/dagster/dagster_home".to_string()
}

/// Run launcher configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LauncherConfig {
    #[serde(flatten)]
    pub client: ClientConfig,

    #[serde(flatten)]
    pub instance: WorkerInstance,

    /// Make the worker exit non-zero when the run fails
    #[serde(default)]
    pub fail_pod_on_run_failure: Option<bool>,

    /// Launcher-level container configuration
    #[serde(flatten)]
    pub container_context: ContainerContext,
}

impl LauncherConfig {
    /// Load configuration from a mounted file
    pub fn from_mounted_file(config_path: &str) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {config_path}: {e}"))
        })?;

        let config = Self::from_yaml(&config_str)?;
        debug!(path = %config_path, "Loaded launcher configuration");
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Configuration(format!("Failed to parse config YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate that configuration is coherent
    pub fn validate(&self) -> Result<()> {
        if self.client.load_incluster_config && self.client.kubeconfig_file.is_some() {
            return Err(Error::Configuration(
                "`kubeconfig_file` is set but `load_incluster_config` is true".to_string(),
            ));
        }

        if !self.instance.dagster_home.starts_with('/') {
            return Err(Error::Configuration(format!(
                "`dagster_home` must be an absolute path, got '{}'",
                self.instance.dagster_home
            )));
        }

        validate_container_context(&self.container_context)
    }
}

/// Step handler configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StepHandlerConfig {
    /// Upper bound on in-flight step workers, enforced by the engine
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Step-scope container configuration, layered above the launcher's
    #[serde(flatten)]
    pub container_context: ContainerContext,
}

impl StepHandlerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| {
            Error::Configuration(format!("Failed to parse step handler config YAML: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == Some(0) {
            return Err(Error::Configuration(
                "`max_concurrent` must be greater than zero".to_string(),
            ));
        }
        validate_container_context(&self.container_context)
    }
}

fn validate_container_context(context: &ContainerContext) -> Result<()> {
    if let Some(policy) = context.image_pull_policy.as_deref() {
        if !VALID_PULL_POLICIES.contains(&policy) {
            return Err(Error::Configuration(format!(
                "Invalid `image_pull_policy` '{policy}'. Expected one of: {}",
                VALID_PULL_POLICIES.join(", ")
            )));
        }
    }

    if let Some(namespace) = context.namespace.as_deref() {
        let valid = !namespace.is_empty()
            && namespace.len() <= MAX_NAMESPACE_LENGTH
            && namespace
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !namespace.starts_with('-')
            && !namespace.ends_with('-');
        if !valid {
            return Err(Error::Configuration(format!(
                "Invalid namespace '{namespace}': must be a DNS-1123 label"
            )));
        }
    }

    Ok(())
}
