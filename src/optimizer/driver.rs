use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use good_lp::Variable;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::SolverBackend;
use super::constraints::{BuiltModel, ConstraintBuilder, ModelHandles, DEFAULT_BIG_M_MARGIN};
use super::objective::{ObjectiveComposer, TieBreak};
use super::types::{Assignment, DriverState, LinearProgram, SchedulingProblem};
use crate::domain::{
    CommitmentKind, DeviceSchedule, Grouping, Schedule, ScheduleEntry, ScheduleStatus,
};
use crate::error::{SchedulerError, SolveError};

/// Knobs of a single solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveSettings {
    pub budget: Duration,
    /// Extra wall-clock time granted on top of `budget` before giving up.
    pub grace: Duration,
    pub tolerance: f64,
    pub big_m_margin: f64,
    pub tie_break: TieBreak,
}

impl Default for SolveSettings {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(30),
            grace: Duration::from_secs(2),
            tolerance: 1e-6,
            big_m_margin: DEFAULT_BIG_M_MARGIN,
            tie_break: TieBreak::default(),
        }
    }
}

/// Caps the number of live solver threads, abandoned ones included.
#[derive(Debug)]
pub struct SolverSlots {
    capacity: usize,
    busy: Mutex<usize>,
    freed: Condvar,
}

impl SolverSlots {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            busy: Mutex::new(0),
            freed: Condvar::new(),
        })
    }

    pub fn unlimited() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Solver threads still running, including those whose caller gave up.
    pub fn busy(&self) -> usize {
        *self.busy.lock()
    }

    /// Wait at most `wait` for a free slot.
    pub fn acquire(self: &Arc<Self>, wait: Duration) -> Option<SolverSlot> {
        let deadline = Instant::now() + wait;
        let mut busy = self.busy.lock();
        while *busy >= self.capacity {
            if self.freed.wait_until(&mut busy, deadline).timed_out() && *busy >= self.capacity {
                return None;
            }
        }
        *busy += 1;
        Some(SolverSlot {
            slots: Arc::clone(self),
        })
    }
}

/// Held by a solver thread until it exits.
#[derive(Debug)]
pub struct SolverSlot {
    slots: Arc<SolverSlots>,
}

impl Drop for SolverSlot {
    fn drop(&mut self) {
        *self.slots.busy.lock() -= 1;
        self.slots.freed.notify_one();
    }
}

/// Run `backend` on its own thread and wait at most `budget + grace`.
///
/// A solver that overruns is abandoned but keeps its slot until its thread
/// finishes, so `slots` bounds the solver threads actually running.
pub fn solve_with_watchdog(
    backend: Arc<dyn SolverBackend>,
    program: LinearProgram,
    budget: Duration,
    grace: Duration,
    slots: &Arc<SolverSlots>,
) -> Result<Assignment, SolveError> {
    let slot = slots.acquire(budget + grace).ok_or_else(|| {
        SolveError::Failed(format!(
            "all {} solver slots stayed busy for {:?}",
            slots.capacity(),
            budget + grace
        ))
    })?;
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    std::thread::Builder::new()
        .name("milp-solve".to_string())
        .spawn(move || {
            let result = backend.solve(program, budget);
            if tx.send(result).is_err() {
                debug!("abandoned solve finished, releasing its slot");
            }
            drop(slot);
        })
        .map_err(|e| SolveError::Failed(format!("cannot start solver thread: {e}")))?;

    match rx.recv_timeout(budget + grace) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                budget_ms = budget.as_millis() as u64,
                waited_ms = started.elapsed().as_millis() as u64,
                "solver exceeded its budget, abandoning it"
            );
            Err(SolveError::Timeout(budget))
        }
        Err(RecvTimeoutError::Disconnected) => Err(SolveError::Failed(
            "solver thread ended without a result".to_string(),
        )),
    }
}

/// Assembles the model, runs the solver and maps the outcome.
///
/// `Built → Solving → {Optimal, Infeasible, SolverError}`. A driver instance
/// serves one run; build a fresh one per problem.
pub struct OptimizationDriver {
    backend: Arc<dyn SolverBackend>,
    settings: SolveSettings,
    slots: Arc<SolverSlots>,
    state: Option<DriverState>,
}

impl OptimizationDriver {
    pub fn new(backend: Arc<dyn SolverBackend>, settings: SolveSettings) -> Self {
        Self {
            backend,
            settings,
            slots: SolverSlots::unlimited(),
            state: None,
        }
    }

    /// Share solver slots with other drivers.
    pub fn with_slots(mut self, slots: Arc<SolverSlots>) -> Self {
        self.slots = slots;
        self
    }

    pub fn state(&self) -> Option<DriverState> {
        self.state
    }

    fn transition(&mut self, next: DriverState) {
        match self.state {
            None if next == DriverState::Built => {}
            Some(current) if current.can_move_to(next) => {}
            current => warn!(?current, %next, "unexpected driver transition"),
        }
        info!(state = %next, "optimization driver");
        self.state = Some(next);
    }

    pub fn run(&mut self, problem: &SchedulingProblem) -> Result<Schedule, SchedulerError> {
        let BuiltModel { buffer, handles } = ConstraintBuilder::new(problem)
            .with_big_m_margin(self.settings.big_m_margin)
            .build()?;
        let composer = ObjectiveComposer::new(problem, &handles, self.settings.tie_break);
        let objective = composer.compose();
        let program = buffer.into_program(objective.expression.clone());
        info!(
            columns = program.column_count(),
            rows = program.row_count(),
            binaries = program.integer_columns,
            solver = self.backend.name(),
            "model ready"
        );
        self.transition(DriverState::Built);

        self.transition(DriverState::Solving);
        let started = Instant::now();
        let outcome = solve_with_watchdog(
            self.backend.clone(),
            program,
            self.settings.budget,
            self.settings.grace,
            &self.slots,
        )
        .and_then(|assignment| {
            let schedule = self.extract(problem, &handles, &assignment)?;
            let costs = composer.evaluate(&objective, &assignment);
            Ok(Schedule { costs, ..schedule })
        });

        match outcome {
            Ok(schedule) => {
                self.transition(DriverState::Optimal);
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    cost = schedule.costs.total,
                    tie_break = schedule.costs.tie_break,
                    "schedule found"
                );
                Ok(schedule)
            }
            Err(SolveError::Infeasible) => {
                self.transition(DriverState::Infeasible);
                Err(SolveError::Infeasible.into())
            }
            Err(err) => {
                self.transition(DriverState::SolverError);
                warn!(error = %err, "solve failed");
                Err(SchedulerError::Solver(err))
            }
        }
    }

    /// Read flows back and check them against every hard constraint.
    fn extract(
        &self,
        problem: &SchedulingProblem,
        handles: &ModelHandles,
        assignment: &Assignment,
    ) -> Result<Schedule, SolveError> {
        let tol = self.settings.tolerance;
        let grid = &problem.grid;
        let len = grid.len();
        let value = |v: &Variable| {
            assignment.get(v).copied().ok_or_else(|| {
                SolveError::Failed("solver returned an incomplete assignment".to_string())
            })
        };
        let clean = |x: f64| if x.abs() < tol { 0.0 } else { x };
        let reject =
            |what: String| SolveError::Failed(format!("solution failed verification: {what}"));

        let mut flows = Vec::with_capacity(problem.devices.len());
        let mut devices = Vec::with_capacity(problem.devices.len());
        for (device, vars) in problem.devices.iter().zip(&handles.devices) {
            let slack = tol * (1.0 + device.flow_magnitude_bound());
            let mut power = Vec::with_capacity(len);
            for j in 0..len {
                let (up, down) = (value(&vars.up[j])?, value(&vars.down[j])?);
                if up < -slack || down > slack {
                    return Err(reject(format!("{} has a mis-signed flow in slot {j}", device.id)));
                }
                if up.min(-down) > slack {
                    return Err(reject(format!(
                        "{} charges and discharges in slot {j}",
                        device.id
                    )));
                }
                let p = clean(up + down);
                if p < device.power_min[j] - slack || p > device.power_max[j] + slack {
                    return Err(reject(format!("{} leaves its power band in slot {j}", device.id)));
                }
                power.push(p);
            }

            let stock_kwh = match (&device.stock, &vars.stock) {
                (Some(model), Some(columns)) => {
                    let solved = columns.iter().map(&value).collect::<Result<Vec<_>, _>>()?;
                    let dt = grid.resolution_hours();
                    let replayed = model.replay(&power, dt);
                    let stock_slack = tol * (1.0 + device.stock_magnitude_bound(dt)) * len as f64;
                    if let Some(j) = model.violations(&replayed, stock_slack.max(1e-6)).first() {
                        return Err(reject(format!(
                            "{} replays out of its stock bounds in slot {j}",
                            device.id
                        )));
                    }
                    Some(solved.into_iter().map(clean).collect())
                }
                _ => None,
            };

            let entries = power
                .iter()
                .enumerate()
                .map(|(j, &p)| ScheduleEntry {
                    time_start: grid.local(grid.slot_start(j)),
                    time_end: grid.local(grid.slot_end(j)),
                    target_power_kw: p,
                    reason: ScheduleEntry::reason_for(
                        p,
                        device.power_min[j] == device.power_max[j],
                    )
                    .to_string(),
                })
                .collect();
            devices.push(DeviceSchedule {
                device: device.id.clone(),
                entries,
                stock_kwh,
            });
            flows.push(power);
        }

        let ems_power_kw: Vec<f64> = (0..len)
            .map(|j| clean(handles.ems_members.iter().map(|&d| flows[d][j]).sum::<f64>()))
            .collect();
        let ems_scale: f64 = handles
            .ems_members
            .iter()
            .map(|&d| problem.devices[d].flow_magnitude_bound())
            .sum();
        let ems_slack = tol * (1.0 + ems_scale);
        if !handles.ems_members.is_empty() {
            let outside = (0..len).find(|&j| !problem.ems.contains(j, ems_power_kw[j], ems_slack));
            if let Some(j) = outside {
                return Err(reject(format!(
                    "site flow {} outside its bounds in slot {j}",
                    ems_power_kw[j]
                )));
            }
        }

        self.verify_linkage(problem, handles, assignment, &flows, &ems_power_kw)?;

        Ok(Schedule {
            id: Uuid::new_v4(),
            status: ScheduleStatus::Optimal,
            created_at: grid.local(Utc::now()),
            valid_from: grid.local(grid.start()),
            valid_until: grid.local(grid.end()),
            devices,
            ems_power_kw,
            costs: Default::default(),
            optimizer_version: format!("milp/{}", self.backend.name()),
        })
    }

    /// Every commitment row holds at the returned point.
    fn verify_linkage(
        &self,
        problem: &SchedulingProblem,
        handles: &ModelHandles,
        assignment: &Assignment,
        flows: &[Vec<f64>],
        ems: &[f64],
    ) -> Result<(), SolveError> {
        let value = |v: &Variable| assignment.get(v).copied().unwrap_or_default();
        for (commitment, vars) in problem.commitments.iter().zip(&handles.commitments) {
            let device = commitment
                .device
                .as_ref()
                .and_then(|id| problem.device_index(id.as_str()));
            for group in &vars.groups {
                let (up, down) = (value(&group.up), value(&group.down));
                for &j in &group.slots {
                    let q = commitment.quantity[j].unwrap_or_default();
                    let scope = match (commitment.kind, device) {
                        (CommitmentKind::Flow, Some(d)) => flows[d][j],
                        (CommitmentKind::Flow, None) => ems[j],
                        (CommitmentKind::Stock, Some(d)) => handles.devices[d]
                            .stock
                            .as_ref()
                            .map(|s| value(&s[j]))
                            .unwrap_or_default(),
                        (CommitmentKind::Stock, None) => 0.0,
                    };
                    let slack =
                        self.settings.tolerance * (1.0 + scope.abs() + q.abs() + up + down) * 10.0;
                    let holds = match commitment.grouping {
                        Grouping::Each => (scope - q - up + down).abs() <= slack,
                        Grouping::Any => scope - q <= up + slack && q - scope <= down + slack,
                    };
                    if !holds {
                        return Err(SolveError::Failed(format!(
                            "solution failed verification: commitment `{}` unlinked in slot {j}",
                            commitment.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
