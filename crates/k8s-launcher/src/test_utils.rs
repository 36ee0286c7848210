//! In-memory collaborators for unit tests.

use crate::client::{ClusterClient, JobStatusCounts};
use crate::engine::{EngineEventData, RunEngine};
use crate::error::{Error, Result};
use crate::run::{Run, RunStatus};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Cluster that records submitted jobs and answers from canned state
#[derive(Default)]
pub struct FakeClusterClient {
    pub submitted: Mutex<Vec<(String, Job)>>,
    pub deleted: Mutex<Vec<String>>,
    pub statuses: Mutex<HashMap<String, JobStatusCounts>>,
    pub pods: Mutex<HashMap<String, Vec<String>>>,
    pub reject_submit: bool,
    pub fail_delete: bool,
    pub fail_status: bool,
    /// `delete` answers "not found" for every job
    pub nothing_to_delete: bool,
}

impl FakeClusterClient {
    pub fn submitted_jobs(&self) -> Vec<(String, Job)> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn deleted_jobs(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn set_status(&self, job_name: &str, counts: JobStatusCounts) {
        self.statuses
            .lock()
            .unwrap()
            .insert(job_name.to_string(), counts);
    }

    pub fn set_pods(&self, job_name: &str, pods: &[&str]) {
        self.pods.lock().unwrap().insert(
            job_name.to_string(),
            pods.iter().map(ToString::to_string).collect(),
        );
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn submit(&self, job: Job, namespace: &str) -> Result<()> {
        if self.reject_submit {
            return Err(Error::ClientConfig("admission webhook denied the request".to_string()));
        }
        self.submitted
            .lock()
            .unwrap()
            .push((namespace.to_string(), job));
        Ok(())
    }

    async fn delete(&self, job_name: &str, _namespace: &str) -> Result<bool> {
        if self.fail_delete {
            return Err(Error::ClientConfig("the server is currently unable to handle the request".to_string()));
        }
        if self.nothing_to_delete {
            return Ok(false);
        }
        self.deleted.lock().unwrap().push(job_name.to_string());
        Ok(true)
    }

    async fn get_status(&self, job_name: &str, _namespace: &str) -> Result<JobStatusCounts> {
        if self.fail_status {
            return Err(Error::ClientConfig("connection reset by peer".to_string()));
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(job_name)
            .copied()
            .unwrap_or_default())
    }

    async fn list_pod_names(&self, job_name: &str, _namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .get(job_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_pod_diagnostics(
        &self,
        pod_name: &str,
        _namespace: &str,
        container_name: &str,
    ) -> Result<String> {
        Ok(format!("Debug information for pod {pod_name} (container {container_name})"))
    }
}

/// Engine that keeps runs in memory and records every callback
#[derive(Default)]
pub struct RecordingEngine {
    pub runs: Mutex<HashMap<String, Run>>,
    pub resume_attempts: Mutex<HashMap<String, u32>>,
    pub events: Mutex<Vec<(String, String, EngineEventData)>>,
    pub tags: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl RecordingEngine {
    pub fn with_run(run: Run) -> Self {
        let engine = Self::default();
        engine.add_run(run);
        engine
    }

    pub fn add_run(&self, run: Run) {
        self.runs.lock().unwrap().insert(run.run_id.clone(), run);
    }

    pub fn set_resume_attempts(&self, run_id: &str, attempts: u32) {
        self.resume_attempts
            .lock()
            .unwrap()
            .insert(run_id.to_string(), attempts);
    }

    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message, _)| message.clone())
            .collect()
    }

    pub fn events(&self) -> Vec<(String, String, EngineEventData)> {
        self.events.lock().unwrap().clone()
    }

    pub fn recorded_tags(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.tags.lock().unwrap().clone()
    }

    pub fn status_of(&self, run_id: &str) -> Option<RunStatus> {
        self.runs.lock().unwrap().get(run_id).map(|run| run.status)
    }
}

#[async_trait]
impl RunEngine for RecordingEngine {
    async fn get_run_by_id(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.runs.lock().unwrap().get(run_id).cloned())
    }

    async fn count_resume_run_attempts(&self, run_id: &str) -> Result<u32> {
        Ok(self
            .resume_attempts
            .lock()
            .unwrap()
            .get(run_id)
            .copied()
            .unwrap_or(0))
    }

    async fn report_event(&self, run: &Run, message: &str, data: EngineEventData) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((run.run_id.clone(), message.to_string(), data));
        Ok(())
    }

    async fn add_run_tags(&self, run_id: &str, tags: BTreeMap<String, String>) -> Result<()> {
        if let Some(run) = self.runs.lock().unwrap().get_mut(run_id) {
            run.tags.extend(tags.clone());
        }
        self.tags.lock().unwrap().push((run_id.to_string(), tags));
        Ok(())
    }

    async fn report_run_canceling(&self, run: &Run) -> Result<()> {
        if let Some(stored) = self.runs.lock().unwrap().get_mut(&run.run_id) {
            stored.status = RunStatus::Canceling;
        }
        Ok(())
    }
}
