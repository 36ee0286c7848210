/*
 * Kubernetes Run Launcher - isolated run and step workers on Kubernetes Jobs
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Kubernetes run launcher core library
//!
//! Launches one Kubernetes Job per workflow run (or per execution step),
//! polls worker health, terminates workers and names resumed attempts so
//! they never collide with the job of an earlier attempt.

pub mod args;
pub mod client;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod job;
pub mod launcher;
pub mod naming;
pub mod run;
pub mod step_handler;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types
pub use client::{ClusterClient, JobStatusCounts, KubeClusterClient};
pub use config::{ClientConfig, LauncherConfig, StepHandlerConfig, WorkerInstance};
pub use context::{ContainerContext, Resources, UserDefinedK8sConfig};
pub use engine::{EngineEventData, RunEngine};
pub use error::{Error, Result};
pub use launcher::K8sRunLauncher;
pub use run::{CodeLocationOrigin, JobOrigin, Run, RunStatus};
pub use step_handler::{ExecutionStep, StepEvent, StepEventKind, StepHandler, StepHandlerContext};
pub use worker::{ClusterWorker, HealthCheckResult, RunWorker, StepWorker, WorkerStatus};
