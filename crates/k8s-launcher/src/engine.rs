//! Callbacks into the orchestration engine.
//!
//! The launcher never owns run state. Everything it learns or decides is
//! reported back through [`RunEngine`].

use crate::error::Result;
use crate::run::Run;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Structured payload attached to an engine event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineEventData {
    pub metadata: BTreeMap<String, String>,
    /// Error text when the event reports a failure
    pub error: Option<String>,
}

impl EngineEventData {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn engine_error(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait RunEngine: Send + Sync {
    async fn get_run_by_id(&self, run_id: &str) -> Result<Option<Run>>;

    /// Number of times the run has been resumed after its worker was lost
    async fn count_resume_run_attempts(&self, run_id: &str) -> Result<u32>;

    async fn report_event(&self, run: &Run, message: &str, data: EngineEventData) -> Result<()>;

    async fn add_run_tags(&self, run_id: &str, tags: BTreeMap<String, String>) -> Result<()>;

    /// Move the run into `CANCELING`
    async fn report_run_canceling(&self, run: &Run) -> Result<()>;
}
