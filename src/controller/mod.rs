pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{Config, RetryConfig};
use crate::domain::Schedule;
use crate::error::{SchedulerError, ValidationError};
use crate::flex::{translate, ScheduleRequest, TranslatorSettings};
use crate::optimizer::{
    backend_for, OptimizationDriver, SchedulingProblem, SolveSettings, SolverBackend, SolverSlots,
};

pub use scheduler::{SchedulingService, TaskStatus};

/// How solver errors are retried. Infeasible and invalid problems never are.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub budget_growth: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            budget_growth: 2.0,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            budget_growth: cfg.budget_growth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SchedulerSettings {
    pub solve: SolveSettings,
    pub translator: TranslatorSettings,
    pub retry: RetryPolicy,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            solve: cfg.solve_settings(),
            translator: cfg.translator_settings(),
            retry: RetryPolicy::from(&cfg.retry),
        }
    }
}

/// Blocking front door: request in, schedule out.
///
/// Each call builds its own problem and driver, so one `Scheduler` can be
/// shared between threads.
#[derive(Clone)]
pub struct Scheduler {
    backend: Arc<dyn SolverBackend>,
    settings: SchedulerSettings,
    slots: Arc<SolverSlots>,
}

impl Scheduler {
    pub fn new(backend: Arc<dyn SolverBackend>, settings: SchedulerSettings) -> Self {
        Self {
            backend,
            settings,
            slots: SolverSlots::unlimited(),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ValidationError> {
        Ok(Self::new(
            backend_for(cfg.solver.backend)?,
            SchedulerSettings::from_config(cfg),
        )
        .with_solver_slots(SolverSlots::new(cfg.service.max_concurrent_jobs)))
    }

    /// Bound the solver threads alive at once, counting abandoned solves.
    pub fn with_solver_slots(mut self, slots: Arc<SolverSlots>) -> Self {
        self.slots = slots;
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn live_solves(&self) -> usize {
        self.slots.busy()
    }

    pub fn schedule(&self, request: &ScheduleRequest) -> Result<Schedule, SchedulerError> {
        let problem = translate(request, &self.settings.translator)?;
        self.schedule_problem(&problem)
    }

    /// Solve with retries, growing the budget after every retryable failure.
    pub fn schedule_problem(&self, problem: &SchedulingProblem) -> Result<Schedule, SchedulerError> {
        let retry = self.settings.retry;
        let mut budget = self.settings.solve.budget;
        let mut attempt = 1;
        loop {
            match self.solve_problem(problem, budget) {
                Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                    let next = budget.mul_f64(retry.budget_growth);
                    warn!(
                        attempt,
                        error = %err,
                        next_budget_ms = next.as_millis() as u64,
                        "solve failed, retrying"
                    );
                    budget = next;
                    attempt += 1;
                }
                outcome => {
                    if outcome.is_ok() && attempt > 1 {
                        info!(attempt, "solve succeeded after retrying");
                    }
                    return outcome;
                }
            }
        }
    }

    /// One attempt with an explicit budget.
    pub fn solve_problem(
        &self,
        problem: &SchedulingProblem,
        budget: Duration,
    ) -> Result<Schedule, SchedulerError> {
        let settings = SolveSettings {
            budget,
            ..self.settings.solve
        };
        OptimizationDriver::new(self.backend.clone(), settings)
            .with_slots(self.slots.clone())
            .run(problem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};

    use crate::domain::{Commitment, Device, DeviceId, Grouping, StockModel, TimeGrid};
    use crate::error::SolveError;
    use crate::optimizer::MockSolverBackend;

    fn problem() -> SchedulingProblem {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let grid = TimeGrid::with_slots(start, chrono::Duration::hours(1), 2).unwrap();
        let battery = Device::flexible(DeviceId::new("battery"), vec![-1.0; 2], vec![1.0; 2])
            .with_stock(StockModel::ideal(1.0, 2));
        let energy = Commitment::flow(
            "energy",
            vec![Some(0.0); 2],
            vec![0.2; 2],
            vec![-0.2; 2],
            Grouping::Each,
        );
        SchedulingProblem::new(grid, vec![battery], vec![energy])
    }

    fn scheduler(mock: MockSolverBackend, max_attempts: u32) -> Scheduler {
        let settings = SchedulerSettings {
            solve: SolveSettings {
                budget: Duration::from_millis(100),
                grace: Duration::from_millis(500),
                ..SolveSettings::default()
            },
            retry: RetryPolicy {
                max_attempts,
                budget_growth: 2.0,
            },
            ..SchedulerSettings::default()
        };
        Scheduler::new(Arc::new(mock), settings)
    }

    #[test]
    fn test_solver_errors_are_retried_with_growing_budget() {
        let budgets = Arc::new(Mutex::new(Vec::new()));
        let seen = budgets.clone();
        let mut mock = MockSolverBackend::new();
        mock.expect_name().return_const("mock");
        mock.expect_solve().times(3).returning(move |_, budget| {
            seen.lock().unwrap().push(budget);
            Err(SolveError::Failed("numerical trouble".into()))
        });

        let err = scheduler(mock, 3).schedule_problem(&problem()).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            *budgets.lock().unwrap(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[test]
    fn test_infeasible_is_not_retried() {
        let mut mock = MockSolverBackend::new();
        mock.expect_name().return_const("mock");
        mock.expect_solve().times(1).returning(|_, _| Err(SolveError::Infeasible));

        let err = scheduler(mock, 5).schedule_problem(&problem()).unwrap_err();
        assert!(matches!(err, SchedulerError::Infeasible(_)));
    }

    #[test]
    fn test_invalid_request_never_reaches_the_solver() {
        let mut mock = MockSolverBackend::new();
        mock.expect_name().return_const("mock");
        mock.expect_solve().never();
        let request: ScheduleRequest = serde_json::from_str(
            r#"{"start": "2025-01-01T00:00:00Z", "duration": "PT2H", "resolution": "PT1H",
                "devices": [{"name": "battery", "flex-model": {"soc-at-start": 1}}],
                "flex-context": {"consumption-price": 0.3}}"#,
        )
        .unwrap();

        let err = scheduler(mock, 3).schedule(&request).unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        assert_eq!(err.status(), None);
    }
}
