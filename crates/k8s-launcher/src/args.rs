//! Worker process arguments.
//!
//! A worker job re-hydrates its run from serialized arguments passed on the
//! command line: `dagster api <command> <json>`.

use crate::error::Result;
use crate::run::JobOrigin;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const WORKER_EXECUTABLE: &str = "dagster";
const WORKER_API_GROUP: &str = "api";

/// Arguments for starting (or resuming) a run worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRunArgs {
    pub job_origin: JobOrigin,
    pub run_id: String,
    /// Exit non-zero when the run fails so the pod is marked failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_exit_code_on_failure: Option<bool>,
}

impl ExecuteRunArgs {
    pub fn command_args(&self) -> Result<Vec<String>> {
        worker_command("execute_run", self)
    }

    /// Same payload, but asks the worker to resume an interrupted run
    pub fn resume_command_args(&self) -> Result<Vec<String>> {
        worker_command("resume_run", self)
    }
}

/// Retry state known to the orchestrator when steps are launched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownExecutionState {
    /// Number of previous attempts per step key
    #[serde(default)]
    pub previous_retry_attempts: BTreeMap<String, u32>,
}

impl KnownExecutionState {
    pub fn attempt_count(&self, step_key: &str) -> u32 {
        self.previous_retry_attempts
            .get(step_key)
            .copied()
            .unwrap_or(0)
    }
}

/// Arguments for executing a set of steps in a step worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteStepArgs {
    pub job_origin: JobOrigin,
    pub run_id: String,
    pub step_keys_to_execute: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_state: Option<KnownExecutionState>,
}

impl ExecuteStepArgs {
    /// Copy of these arguments restricted to a single step
    #[must_use]
    pub fn for_step(&self, step_key: &str) -> Self {
        Self {
            step_keys_to_execute: vec![step_key.to_string()],
            ..self.clone()
        }
    }

    /// Retry attempt of `step_key`, if one is known
    pub fn retry_attempt(&self, step_key: &str) -> Option<u32> {
        self.known_state
            .as_ref()
            .map(|state| state.attempt_count(step_key))
            .filter(|attempt| *attempt > 0)
    }

    pub fn command_args(&self) -> Result<Vec<String>> {
        worker_command("execute_step", self)
    }
}

fn worker_command<T: Serialize>(command: &str, payload: &T) -> Result<Vec<String>> {
    Ok(vec![
        WORKER_EXECUTABLE.to_string(),
        WORKER_API_GROUP.to_string(),
        command.to_string(),
        serde_json::to_string(payload)?,
    ])
}
