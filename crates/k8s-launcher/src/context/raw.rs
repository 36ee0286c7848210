//! Raw Kubernetes config overrides.
//!
//! A raw override is free-form configuration passed through to the job
//! specification. Each section is a JSON object keyed by Kubernetes field
//! names, in camelCase or snake_case, and is deep-merged onto the matching
//! part of the Job once its keys are normalised to camelCase.

use crate::error::{Error, Result};
use crate::run::K8S_CONFIG_TAG;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// List-valued fields that accumulate across sources instead of being replaced.
const CONCATENATED_LIST_KEYS: &[&str] = &[
    "env",
    "envFrom",
    "volumeMounts",
    "volumes",
    "ports",
    "imagePullSecrets",
    "tolerations",
];

/// Fields whose keys are user data, such as label names, and are kept as written.
const VERBATIM_KEY_FIELDS: &[&str] = &[
    "labels",
    "annotations",
    "nodeSelector",
    "limits",
    "requests",
    "matchLabels",
    "data",
    "stringData",
    "binaryData",
    "volumeAttributes",
    "parameters",
];

/// User supplied overrides for each part of the worker Job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserDefinedK8sConfig {
    /// Merged onto the worker container
    #[serde(alias = "containerConfig", deserialize_with = "camel_case_section")]
    pub container_config: Map<String, Value>,

    /// Merged onto the pod template metadata
    #[serde(alias = "podTemplateSpecMetadata", deserialize_with = "camel_case_section")]
    pub pod_template_spec_metadata: Map<String, Value>,

    /// Merged onto the pod spec
    #[serde(alias = "podSpecConfig", deserialize_with = "camel_case_section")]
    pub pod_spec_config: Map<String, Value>,

    /// Merged onto the Job object itself
    #[serde(alias = "jobConfig", deserialize_with = "camel_case_section")]
    pub job_config: Map<String, Value>,

    /// Merged onto the Job metadata
    #[serde(alias = "jobMetadata", deserialize_with = "camel_case_section")]
    pub job_metadata: Map<String, Value>,

    /// Merged onto the Job spec
    #[serde(alias = "jobSpecConfig", deserialize_with = "camel_case_section")]
    pub job_spec_config: Map<String, Value>,
}

impl UserDefinedK8sConfig {
    /// Parse a raw override from JSON text.
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw).map_err(|e| {
            Error::Configuration(format!("Raw Kubernetes config is not valid JSON: {e}"))
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| {
            Error::Configuration(format!("Raw Kubernetes config is malformed: {e}"))
        })
    }

    /// Read the override carried in the `dagster-k8s/config` tag, if any.
    pub fn from_tags(tags: &BTreeMap<String, String>) -> Result<Self> {
        match tags.get(K8S_CONFIG_TAG) {
            Some(raw) => Self::from_json(raw).map_err(|e| match e {
                Error::Configuration(msg) => {
                    Error::Configuration(format!("Invalid `{K8S_CONFIG_TAG}` tag: {msg}"))
                }
                other => other,
            }),
            None => Ok(Self::default()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.container_config.is_empty()
            && self.pod_template_spec_metadata.is_empty()
            && self.pod_spec_config.is_empty()
            && self.job_config.is_empty()
            && self.job_metadata.is_empty()
            && self.job_spec_config.is_empty()
    }

    /// Deep-merge `other` on top of `self`, section by section.
    pub fn merge(&mut self, other: &Self) {
        deep_merge(&mut self.container_config, &other.container_config);
        deep_merge(
            &mut self.pod_template_spec_metadata,
            &other.pod_template_spec_metadata,
        );
        deep_merge(&mut self.pod_spec_config, &other.pod_spec_config);
        deep_merge(&mut self.job_config, &other.job_config);
        deep_merge(&mut self.job_metadata, &other.job_metadata);
        deep_merge(&mut self.job_spec_config, &other.job_spec_config);
    }

    /// Image requested by the container override
    pub fn container_image(&self) -> Option<&str> {
        self.container_config
            .get("image")
            .and_then(Value::as_str)
            .filter(|image| !image.trim().is_empty())
    }

    /// Container name requested by the container override
    pub fn container_name(&self) -> Option<&str> {
        self.container_config.get("name").and_then(Value::as_str)
    }
}

fn camel_case_section<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut section = Map::deserialize(deserializer)?;
    camel_case_keys(&mut section);
    Ok(section)
}

/// Rewrite snake_case field names to camelCase, recursively.
///
/// Objects under [`VERBATIM_KEY_FIELDS`] keep their keys; their values are
/// still walked when they are objects of fields themselves.
fn camel_case_keys(map: &mut Map<String, Value>) {
    let entries = std::mem::take(map);
    for (key, mut value) in entries {
        let key = if key.contains('_') { snake_to_camel(&key) } else { key };
        if !VERBATIM_KEY_FIELDS.contains(&key.as_str()) {
            camel_case_value(&mut value);
        }
        match (map.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, &incoming);
            }
            (_, value) => {
                map.insert(key, value);
            }
        }
    }
}

fn camel_case_value(value: &mut Value) {
    match value {
        Value::Object(map) => camel_case_keys(map),
        Value::Array(items) => items.iter_mut().for_each(camel_case_value),
        _ => {}
    }
}

fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '_' && !out.is_empty() {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Merge `overlay` into `base`, overwriting only the keys `overlay` defines.
///
/// Nested objects merge recursively. Arrays under [`CONCATENATED_LIST_KEYS`]
/// are concatenated with exact duplicates dropped; all other values replace
/// the base value.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, incoming) in overlay {
        match (base.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (Some(Value::Array(existing)), Value::Array(incoming))
                if CONCATENATED_LIST_KEYS.contains(&key.as_str()) =>
            {
                for item in incoming {
                    if !existing.contains(item) {
                        existing.push(item.clone());
                    }
                }
            }
            _ => {
                base.insert(key.clone(), incoming.clone());
            }
        }
    }
}

/// Deep-merge a raw section onto an arbitrary JSON value that must be an object.
pub(crate) fn merge_onto(target: &mut Value, overlay: &Map<String, Value>) {
    if overlay.is_empty() {
        return;
    }
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        deep_merge(map, overlay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn nested_keys_survive_partial_override() {
        let mut base = object(json!({
            "resources": {"limits": {"cpu": "500m"}, "requests": {"cpu": "250m"}}
        }));
        let overlay = object(json!({"resources": {"limits": {"memory": "2560Mi"}}}));

        deep_merge(&mut base, &overlay);

        assert_eq!(
            Value::Object(base),
            json!({
                "resources": {
                    "limits": {"cpu": "500m", "memory": "2560Mi"},
                    "requests": {"cpu": "250m"}
                }
            })
        );
    }

    #[test]
    fn scalar_conflicts_take_overlay_value() {
        let mut base = object(json!({"image": "a", "resources": {"limits": {"cpu": "1"}}}));
        let overlay = object(json!({"image": "b", "resources": {"limits": {"cpu": "2"}}}));

        deep_merge(&mut base, &overlay);

        assert_eq!(base["image"], json!("b"));
        assert_eq!(base["resources"]["limits"]["cpu"], json!("2"));
    }

    #[test]
    fn mergeable_lists_concatenate_without_duplicates() {
        let mut base = object(json!({
            "volumeMounts": [{"name": "a", "mountPath": "/a"}],
            "args": ["one"]
        }));
        let overlay = object(json!({
            "volumeMounts": [{"name": "a", "mountPath": "/a"}, {"name": "b", "mountPath": "/b"}],
            "args": ["two"]
        }));

        deep_merge(&mut base, &overlay);

        assert_eq!(base["volumeMounts"].as_array().unwrap().len(), 2);
        assert_eq!(base["args"], json!(["two"]));
    }

    #[test]
    fn malformed_tag_is_configuration_error() {
        let mut tags = BTreeMap::new();
        tags.insert(K8S_CONFIG_TAG.to_string(), "{not json".to_string());

        let err = UserDefinedK8sConfig::from_tags(&tags).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains(K8S_CONFIG_TAG));
    }

    #[test]
    fn non_object_section_is_rejected() {
        let err = UserDefinedK8sConfig::from_json(r#"{"container_config": ["nope"]}"#).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = UserDefinedK8sConfig::from_json(r#"{"unknown_section": {}}"#).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn snake_case_fields_are_normalised() {
        let config = UserDefinedK8sConfig::from_value(json!({
            "container_config": {
                "image_pull_policy": "Always",
                "volume_mounts": [{"name": "data", "mount_path": "/data", "sub_path": "x"}],
                "resources": {"limits": {"nvidia_gpu": "1"}}
            },
            "pod_template_spec_metadata": {"labels": {"team_name": "etl"}},
            "pod_spec_config": {"node_selector": {"disk_type": "ssd"}}
        }))
        .unwrap();

        let container = &config.container_config;
        assert_eq!(container["imagePullPolicy"], json!("Always"));
        assert_eq!(
            container["volumeMounts"],
            json!([{"name": "data", "mountPath": "/data", "subPath": "x"}])
        );
        assert!(!container.contains_key("volume_mounts"));
        assert_eq!(container["resources"]["limits"]["nvidia_gpu"], json!("1"));
        assert_eq!(
            config.pod_template_spec_metadata["labels"]["team_name"],
            json!("etl")
        );
        assert_eq!(config.pod_spec_config["nodeSelector"]["disk_type"], json!("ssd"));
    }

    #[test]
    fn mixed_case_spellings_merge_into_one_field() {
        let config = UserDefinedK8sConfig::from_value(json!({
            "container_config": {
                "securityContext": {"runAsUser": 1000},
                "security_context": {"run_as_group": 2000}
            }
        }))
        .unwrap();

        assert_eq!(
            config.container_config["securityContext"],
            json!({"runAsUser": 1000, "runAsGroup": 2000})
        );
    }

    #[test]
    fn camel_case_section_names_are_accepted() {
        let config =
            UserDefinedK8sConfig::from_json(r#"{"containerConfig": {"image": "custom:1"}}"#)
                .unwrap();
        assert_eq!(config.container_image(), Some("custom:1"));
    }
}
