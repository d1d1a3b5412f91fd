use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{RwLock, Semaphore};
use tracing::{error, info, warn};

use super::Scheduler;
use crate::config::Config;
use crate::domain::Schedule;
use crate::error::{SchedulerError, SolveError, ValidationError};
use crate::flex::ScheduleRequest;
use crate::optimizer::{SchedulingProblem, SolverSlots};

/// Task status tracking
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub infeasible_count: u64,
    pub error_count: u64,
}

/// Async front for independent scheduling jobs.
///
/// Every job runs on the blocking pool with its own model; at most
/// `max_concurrent_jobs` jobs run at the same time, and at most as many solver
/// threads, including ones abandoned after a timeout.
pub struct SchedulingService {
    scheduler: Arc<Scheduler>,
    permits: Arc<Semaphore>,
    status: Arc<RwLock<TaskStatus>>,
}

impl SchedulingService {
    pub fn new(scheduler: Scheduler, max_concurrent_jobs: usize) -> Self {
        let scheduler = scheduler.with_solver_slots(SolverSlots::new(max_concurrent_jobs));
        Self {
            scheduler: Arc::new(scheduler),
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            status: Arc::new(RwLock::new(TaskStatus::default())),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ValidationError> {
        Ok(Self::new(
            Scheduler::from_config(cfg)?,
            cfg.service.max_concurrent_jobs,
        ))
    }

    pub async fn submit(&self, request: ScheduleRequest) -> Result<Schedule, SchedulerError> {
        self.run(move |scheduler| scheduler.schedule(&request)).await
    }

    pub async fn submit_problem(
        &self,
        problem: SchedulingProblem,
    ) -> Result<Schedule, SchedulerError> {
        self.run(move |scheduler| scheduler.schedule_problem(&problem))
            .await
    }

    /// Run all requests concurrently; results keep the input order.
    pub async fn submit_all(
        &self,
        requests: Vec<ScheduleRequest>,
    ) -> Vec<Result<Schedule, SchedulerError>> {
        join_all(requests.into_iter().map(|r| self.submit(r))).await
    }

    pub async fn status(&self) -> TaskStatus {
        self.status.read().await.clone()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Solver threads still running, including abandoned ones.
    pub fn live_solves(&self) -> usize {
        self.scheduler.live_solves()
    }

    async fn run<F>(&self, job: F) -> Result<Schedule, SchedulerError>
    where
        F: FnOnce(&Scheduler) -> Result<Schedule, SchedulerError> + Send + 'static,
    {
        let _permit = self.permits.clone().acquire_owned().await.map_err(|_| {
            SchedulerError::Solver(SolveError::Failed("scheduling service is closed".to_string()))
        })?;

        let now = Utc::now();
        let mut status = self.status.write().await;
        status.last_run = Some(now);
        status.run_count += 1;
        drop(status);

        let scheduler = self.scheduler.clone();
        let result = tokio::task::spawn_blocking(move || job(&scheduler))
            .await
            .unwrap_or_else(|e| {
                Err(SchedulerError::Solver(SolveError::Failed(format!(
                    "scheduling job did not complete: {e}"
                ))))
            });

        let mut status = self.status.write().await;
        match &result {
            Ok(schedule) => {
                status.last_success = Some(now);
                status.success_count += 1;
                status.last_error = None;
                info!(schedule = %schedule.id, "scheduling job completed");
            }
            Err(e @ SchedulerError::Infeasible(_)) => {
                status.infeasible_count += 1;
                status.last_error = Some(e.to_string());
                warn!(error = %e, "scheduling job infeasible");
            }
            Err(e) => {
                status.error_count += 1;
                status.last_error = Some(e.to_string());
                error!(error = %e, "scheduling job failed");
            }
        }
        result
    }
}
