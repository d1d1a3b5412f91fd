//! Pluggable MILP solvers.
//!
//! Every backend goes through `good_lp`; which ones are compiled in is
//! controlled by the crate features `microlp` (pure Rust), `highs` and `cbc`.

use std::sync::Arc;
use std::time::Duration;

#[cfg(any(feature = "microlp", feature = "highs", feature = "cbc"))]
use good_lp::{ResolutionError, Solution, SolutionStatus, SolverModel};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::types::{Assignment, LinearProgram};
use crate::error::{SolveError, ValidationError};

/// A solver accepts a complete program and returns values for its columns.
///
/// Implementations block for at most roughly `budget`; the driver enforces
/// the budget independently in case a solver cannot.
#[cfg_attr(test, mockall::automock)]
pub trait SolverBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(&self, program: LinearProgram, budget: Duration) -> Result<Assignment, SolveError>;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    #[default]
    Microlp,
    Highs,
    Cbc,
}

impl SolverKind {
    pub fn is_available(self) -> bool {
        match self {
            SolverKind::Microlp => cfg!(feature = "microlp"),
            SolverKind::Highs => cfg!(feature = "highs"),
            SolverKind::Cbc => cfg!(feature = "cbc"),
        }
    }
}

/// `good_lp`-backed solver of the given kind.
#[derive(Debug, Clone, Copy)]
pub struct GoodLpBackend {
    kind: SolverKind,
}

impl GoodLpBackend {
    pub fn new(kind: SolverKind) -> Result<Self, ValidationError> {
        if !kind.is_available() {
            return Err(ValidationError::Unsupported(format!(
                "solver `{kind}` is not compiled in; enable the `{kind}` feature"
            )));
        }
        Ok(Self { kind })
    }

    pub fn kind(&self) -> SolverKind {
        self.kind
    }
}

/// Shared handle to a configured backend.
pub fn backend_for(kind: SolverKind) -> Result<Arc<dyn SolverBackend>, ValidationError> {
    Ok(Arc::new(GoodLpBackend::new(kind)?))
}

#[cfg(any(feature = "microlp", feature = "highs", feature = "cbc"))]
fn map_resolution(err: ResolutionError) -> SolveError {
    match err {
        ResolutionError::Infeasible => SolveError::Infeasible,
        ResolutionError::Unbounded => SolveError::Unbounded,
        other => SolveError::Failed(other.to_string()),
    }
}

/// Only a proven optimum is usable. A solver stopped by its time or gap
/// limit hands back an incumbent, which is reported as a timeout.
#[cfg(any(feature = "microlp", feature = "highs", feature = "cbc"))]
fn check_status(status: SolutionStatus, budget: Duration) -> Result<(), SolveError> {
    match status {
        SolutionStatus::Optimal => Ok(()),
        SolutionStatus::TimeLimit | SolutionStatus::GapLimit => Err(SolveError::Timeout(budget)),
        #[allow(unreachable_patterns)]
        other => Err(SolveError::Failed(format!("solver stopped with status {other:?}"))),
    }
}

#[cfg(any(feature = "microlp", feature = "highs", feature = "cbc"))]
fn run<M>(
    mut model: M,
    constraints: Vec<good_lp::Constraint>,
    columns: &[good_lp::Variable],
    budget: Duration,
) -> Result<Assignment, SolveError>
where
    M: SolverModel<Error = ResolutionError>,
{
    for c in constraints {
        model = model.with(c);
    }
    let solution = model.solve().map_err(map_resolution)?;
    check_status(solution.status(), budget)?;
    Ok(columns.iter().map(|v| (*v, solution.value(*v))).collect())
}

impl SolverBackend for GoodLpBackend {
    fn name(&self) -> &'static str {
        match self.kind {
            SolverKind::Microlp => "good_lp/microlp",
            SolverKind::Highs => "good_lp/highs",
            SolverKind::Cbc => "good_lp/cbc",
        }
    }

    #[allow(unused_variables)]
    fn solve(&self, program: LinearProgram, budget: Duration) -> Result<Assignment, SolveError> {
        let LinearProgram {
            variables,
            objective,
            constraints,
            columns,
            ..
        } = program;
        match self.kind {
            #[cfg(feature = "microlp")]
            SolverKind::Microlp => {
                let model = variables
                    .minimise(objective)
                    .using(good_lp::solvers::microlp::microlp);
                run(model, constraints, &columns, budget)
            }
            #[cfg(feature = "highs")]
            SolverKind::Highs => {
                use good_lp::solvers::WithTimeLimit;
                let model = variables
                    .minimise(objective)
                    .using(good_lp::solvers::highs::highs)
                    .with_time_limit(budget.as_secs_f64());
                run(model, constraints, &columns, budget)
            }
            #[cfg(feature = "cbc")]
            SolverKind::Cbc => {
                use good_lp::solvers::WithTimeLimit;
                let model = variables
                    .minimise(objective)
                    .using(good_lp::solvers::coin_cbc::coin_cbc)
                    .with_time_limit(budget.as_secs_f64());
                run(model, constraints, &columns, budget)
            }
            #[allow(unreachable_patterns)]
            other => Err(SolveError::Failed(format!("solver `{other}` is not compiled in"))),
        }
    }
}
