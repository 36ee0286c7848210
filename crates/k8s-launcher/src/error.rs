//! Error types for the launcher and step handler.

use thiserror::Error;

/// Errors raised while resolving configuration or talking to the cluster.
///
/// Only `Configuration` and `Launch` escape the public launch operations;
/// the other variants are converted into events or health results at the
/// boundary of terminate, health-check and debug-info calls.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed merge input; aborts a launch before any cluster call
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The cluster rejected the job submission
    #[error("Failed to launch Kubernetes job {job_name}: {message}")]
    Launch { job_name: String, message: String },

    /// Deleting the worker job failed
    #[error("Failed to delete Kubernetes job {job_name}: {message}")]
    Termination { job_name: String, message: String },

    /// Querying the worker job status failed
    #[error("Failed to query status of Kubernetes job {job_name}: {message}")]
    HealthCheck { job_name: String, message: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Kubeconfig or in-cluster configuration could not be loaded
    #[error("Kubernetes client configuration error: {0}")]
    ClientConfig(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
