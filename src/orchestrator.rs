//! Glue between planner, launcher, and collector.
//!
//! The orchestrator owns the launcher for the whole session: it provisions
//! the execution environment, fans the planned specs out, and exposes the
//! collector's snapshot stream. Shutdown stops draining and runs the
//! launcher's idempotent teardown; in-flight runners are left to finish on
//! their own and their late reports fall on the floor.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::aggregate::Snapshot;
use crate::bus::{self, BusError, ResultBus};
use crate::collector;
use crate::docker_launcher::DockerLauncher;
use crate::lambda_launcher::LambdaLauncher;
use crate::launcher::{LaunchError, Launcher};
use crate::plan::{self, PlanError, Workload};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub struct Orchestrator {
    workload: Workload,
    launcher: Box<dyn Launcher>,
    bus_override: Option<Arc<dyn ResultBus>>,
    collector: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Picks the execution backing from the workload: local containers when
    /// `run_docker` is set, AWS Lambda otherwise.
    pub fn new(workload: Workload) -> Self {
        let launcher: Box<dyn Launcher> = if workload.run_docker {
            Box::new(DockerLauncher::new())
        } else {
            Box::new(LambdaLauncher::new())
        };
        Self::with_launcher(workload, launcher)
    }

    pub fn with_launcher(workload: Workload, launcher: Box<dyn Launcher>) -> Self {
        Self {
            workload,
            launcher,
            bus_override: None,
            collector: None,
        }
    }

    /// Replaces the bus the collector consumes from. Used by embeddings and
    /// tests that run runners in-process.
    pub fn with_bus(mut self, bus: Arc<dyn ResultBus>) -> Self {
        self.bus_override = Some(bus);
        self
    }

    /// Provisions, plans, launches, and returns the live snapshot stream.
    pub async fn start(&mut self) -> Result<mpsc::Receiver<Snapshot>, OrchestratorError> {
        self.workload.validate()?;
        self.launcher.setup(&self.workload).await?;

        let specs = plan::plan(
            &self.workload,
            self.launcher.queue_url(),
            self.launcher.queue_region(),
            self.launcher.execution_cap_secs(),
        )?;
        info!(
            runners = specs.len(),
            regions = self.workload.regions.len(),
            "workload planned"
        );

        let bus = match &self.bus_override {
            Some(bus) => Arc::clone(bus),
            None => {
                bus::connect(self.launcher.queue_url(), self.launcher.queue_region()).await?
            }
        };
        // The collector starts before the first launch; the bus retains
        // anything runners publish while launches are still going out.
        let (handle, snapshots) = collector::start(bus, specs.len());
        self.collector = Some(handle);

        for spec in &specs {
            self.launcher.launch(spec).await?;
        }
        info!(runners = specs.len(), "fleet launched");
        Ok(snapshots)
    }

    /// Stops draining and tears the session infrastructure down. Safe to
    /// call more than once.
    pub async fn shutdown(&mut self) {
        if let Some(collector) = self.collector.take() {
            collector.abort();
        }
        self.launcher.teardown().await;
    }
}
