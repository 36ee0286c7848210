//! Container context resolution
//!
//! A [`ContainerContext`] is the effective launch configuration of one run or
//! step. It is assembled from layers, lowest precedence first:
//!
//! 1. launcher static config
//! 2. step handler config (step scope only)
//! 3. the container context attached to the run's code location
//! 4. the `dagster-k8s/config` run tag (run scope only)
//! 5. the `dagster-k8s/config` step tag (step scope only)
//!
//! Each layer is merged with [`ContainerContext::merge`].

mod raw;

pub use raw::{deep_merge, UserDefinedK8sConfig};
pub(crate) use raw::merge_onto;

use crate::error::{Error, Result};
use crate::run::Run;
use k8s_openapi::api::core::v1::{EnvVar, SecurityContext, Volume, VolumeMount};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

const DEFAULT_NAMESPACE: &str = "default";

/// Key of the Kubernetes section inside a code location container context
const K8S_CONTAINER_CONTEXT_KEY: &str = "k8s";

/// Resource limits and requests for the worker container
///
/// Quantities may be written as strings (`500m`) or bare numbers (`1`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    #[serde(deserialize_with = "quantities")]
    pub limits: BTreeMap<String, String>,
    #[serde(deserialize_with = "quantities")]
    pub requests: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuantityValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
}

fn quantities<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, QuantityValue>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, value)| {
            let quantity = match value {
                QuantityValue::Text(text) => text,
                QuantityValue::Integer(n) => n.to_string(),
                QuantityValue::Decimal(n) => n.to_string(),
            };
            (name, quantity)
        })
        .collect())
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty() && self.requests.is_empty()
    }

    /// Leaf-wise merge; `other` wins for every key it defines.
    pub fn merge(&mut self, other: &Self) {
        self.limits
            .extend(other.limits.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.requests
            .extend(other.requests.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Effective merged configuration for launching a worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerContext {
    /// Namespace the worker job is created in
    #[serde(alias = "job_namespace")]
    pub namespace: Option<String>,

    /// Default image for worker jobs
    #[serde(alias = "job_image")]
    pub image: Option<String>,

    pub image_pull_policy: Option<String>,

    /// Names of image pull secrets
    pub image_pull_secrets: Vec<String>,

    pub service_account_name: Option<String>,

    /// ConfigMaps exposed to the worker through `envFrom`
    pub env_config_maps: Vec<String>,

    /// Secrets exposed to the worker through `envFrom`
    pub env_secrets: Vec<String>,

    /// `NAME` (value read from the launcher process) or `NAME=value`
    pub env_vars: Vec<String>,

    pub resources: Resources,

    pub volumes: Vec<Volume>,

    pub volume_mounts: Vec<VolumeMount>,

    pub labels: BTreeMap<String, String>,

    pub scheduler_name: Option<String>,

    pub security_context: Option<SecurityContext>,

    /// Raw overrides passed through to the Job specification
    pub run_k8s_config: UserDefinedK8sConfig,
}

impl ContainerContext {
    /// Context holding only a raw override
    pub fn from_raw_config(run_k8s_config: UserDefinedK8sConfig) -> Self {
        Self {
            run_k8s_config,
            ..Default::default()
        }
    }

    /// Parse the container context attached to a code location.
    ///
    /// Only the `k8s` section is read; contexts for other platforms yield an
    /// empty layer.
    pub fn from_origin_config(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => match map.get(K8S_CONTAINER_CONTEXT_KEY) {
                Some(Value::Null) | None => Ok(Self::default()),
                Some(k8s) => serde_json::from_value(k8s.clone()).map_err(|e| {
                    Error::Configuration(format!(
                        "Invalid Kubernetes container context on code location: {e}"
                    ))
                }),
            },
            other => Err(Error::Configuration(format!(
                "Container context must be a mapping, got {other}"
            ))),
        }
    }

    /// Resolve the context for a run worker.
    ///
    /// `base` is the launcher-level context. The run's code-location context
    /// is merged on top, then the run's raw config tag when
    /// `include_run_tags` is set.
    pub fn create_for_run(run: &Run, base: &Self, include_run_tags: bool) -> Result<Self> {
        let mut context = base.clone();

        if let Some(raw) = run
            .job_origin
            .as_ref()
            .and_then(|origin| origin.code_location.container_context.as_ref())
        {
            context.merge(&Self::from_origin_config(raw)?);
        }

        if include_run_tags {
            let tag_config = UserDefinedK8sConfig::from_tags(&run.tags)?;
            if !tag_config.is_empty() {
                debug!(run_id = %run.run_id, "Applying raw Kubernetes config from run tags");
                context.merge(&Self::from_raw_config(tag_config));
            }
        }

        Ok(context)
    }

    /// Merge `other` on top of `self` (other takes precedence).
    pub fn merge(&mut self, other: &Self) {
        if other.namespace.is_some() {
            self.namespace.clone_from(&other.namespace);
        }
        if other.image.is_some() {
            self.image.clone_from(&other.image);
        }
        if other.image_pull_policy.is_some() {
            self.image_pull_policy.clone_from(&other.image_pull_policy);
        }
        if other.service_account_name.is_some() {
            self.service_account_name
                .clone_from(&other.service_account_name);
        }
        if other.scheduler_name.is_some() {
            self.scheduler_name.clone_from(&other.scheduler_name);
        }
        if other.security_context.is_some() {
            self.security_context.clone_from(&other.security_context);
        }

        merge_names(&mut self.image_pull_secrets, &other.image_pull_secrets);
        merge_names(&mut self.env_config_maps, &other.env_config_maps);
        merge_names(&mut self.env_secrets, &other.env_secrets);
        merge_names(&mut self.env_vars, &other.env_vars);

        for volume in &other.volumes {
            match self.volumes.iter_mut().find(|v| v.name == volume.name) {
                Some(existing) => *existing = volume.clone(),
                None => self.volumes.push(volume.clone()),
            }
        }
        for mount in &other.volume_mounts {
            if !self.volume_mounts.contains(mount) {
                self.volume_mounts.push(mount.clone());
            }
        }

        self.labels
            .extend(other.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.resources.merge(&other.resources);
        self.run_k8s_config.merge(&other.run_k8s_config);
    }

    #[must_use]
    pub fn merged(mut self, other: &Self) -> Self {
        self.merge(other);
        self
    }

    pub fn namespace(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Pick the worker image.
    ///
    /// A raw container override wins, then each candidate in order, then the
    /// context's own image.
    pub fn resolve_image<'a>(
        &'a self,
        candidates: impl IntoIterator<Item = Option<&'a str>>,
    ) -> Result<String> {
        self.run_k8s_config
            .container_image()
            .into_iter()
            .chain(candidates.into_iter().flatten())
            .chain(self.image.as_deref())
            .find(|image| !image.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Configuration(
                    "No image configured for worker job: set `image` on the launcher, the code location, or a raw container override".to_string(),
                )
            })
    }

    /// Worker container environment from `env_vars`.
    ///
    /// Later entries win when the same name appears more than once.
    pub fn resolve_env_vars(&self) -> Vec<EnvVar> {
        let parsed = self.env_vars.iter().map(|entry| parse_env_var(entry)).collect();
        dedupe_env_keep_last(parsed)
    }
}

/// Order-stable union of two name lists.
fn merge_names(target: &mut Vec<String>, incoming: &[String]) {
    for name in incoming {
        if !target.contains(name) {
            target.push(name.clone());
        }
    }
}

fn parse_env_var(entry: &str) -> EnvVar {
    if let Some((name, value)) = entry.split_once('=') {
        return EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        };
    }

    let value = std::env::var(entry).ok();
    if value.is_none() {
        warn!(env_var = %entry, "Environment variable requested for worker is not set in launcher process");
    }
    EnvVar {
        name: entry.to_string(),
        value,
        ..Default::default()
    }
}

/// Remove duplicate env vars by name, keeping the last occurrence.
pub(crate) fn dedupe_env_keep_last(env: Vec<EnvVar>) -> Vec<EnvVar> {
    let mut seen_names = HashSet::new();
    let mut deduplicated = Vec::with_capacity(env.len());

    // Process in reverse order to keep the last occurrence of each variable
    for env_var in env.into_iter().rev() {
        if seen_names.insert(env_var.name.clone()) {
            deduplicated.push(env_var);
        }
    }

    deduplicated.reverse();
    deduplicated
}
