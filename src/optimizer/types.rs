use std::collections::{HashMap, HashSet};

use good_lp::{Constraint, Expression, ProblemVariables, Variable, VariableDefinition};
use strum::Display;

use crate::domain::{Commitment, CommitmentKind, Device, EmsBounds, TimeGrid};
use crate::error::ValidationError;

/// Everything one scheduling run optimises over.
#[derive(Debug, Clone)]
pub struct SchedulingProblem {
    pub grid: TimeGrid,
    pub devices: Vec<Device>,
    pub commitments: Vec<Commitment>,
    pub ems: EmsBounds,
}

impl SchedulingProblem {
    pub fn new(grid: TimeGrid, devices: Vec<Device>, commitments: Vec<Commitment>) -> Self {
        let ems = EmsBounds::unbounded(grid.len());
        Self {
            grid,
            devices,
            commitments,
            ems,
        }
    }

    pub fn with_ems(mut self, ems: EmsBounds) -> Self {
        self.ems = ems;
        self
    }

    pub fn device_index(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.id.as_str() == name)
    }

    /// Reject inconsistent inputs before any model is built.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let len = self.grid.len();
        if len == 0 {
            return Err(ValidationError::TimeGrid("grid has no slots".to_string()));
        }
        if self.devices.is_empty() {
            return Err(ValidationError::field("devices", "nothing to schedule"));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(ValidationError::device(device.id.as_str(), "duplicate device name"));
            }
            device.validate(len)?;
        }
        self.ems.validate(len)?;

        for commitment in &self.commitments {
            commitment.validate(len)?;
            if let Some(id) = &commitment.device {
                let index = self.device_index(id.as_str()).ok_or_else(|| {
                    ValidationError::commitment(&commitment.name, format!("unknown device `{id}`"))
                })?;
                if commitment.kind == CommitmentKind::Stock && self.devices[index].stock.is_none() {
                    return Err(ValidationError::commitment(
                        &commitment.name,
                        format!("device `{id}` has no stock to commit"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Solver-agnostic linear/mixed-integer program.
///
/// Owns every column so it can be moved onto a solver thread.
pub struct LinearProgram {
    pub variables: ProblemVariables,
    pub objective: Expression,
    pub constraints: Vec<Constraint>,
    pub columns: Vec<Variable>,
    pub integer_columns: usize,
}

impl LinearProgram {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.constraints.len()
    }
}

impl std::fmt::Debug for LinearProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearProgram")
            .field("columns", &self.columns.len())
            .field("integer_columns", &self.integer_columns)
            .field("rows", &self.constraints.len())
            .finish()
    }
}

/// Column values returned by a solver.
pub type Assignment = HashMap<Variable, f64>;

/// Growing set of columns and rows.
pub struct ModelBuffer {
    pub variables: ProblemVariables,
    pub constraints: Vec<Constraint>,
    pub columns: Vec<Variable>,
    pub integer_columns: usize,
}

impl ModelBuffer {
    pub fn new() -> Self {
        Self {
            variables: ProblemVariables::new(),
            constraints: Vec::new(),
            columns: Vec::new(),
            integer_columns: 0,
        }
    }

    pub fn add(&mut self, definition: VariableDefinition) -> Variable {
        let v = self.variables.add(definition);
        self.columns.push(v);
        v
    }

    pub fn add_binary(&mut self) -> Variable {
        self.integer_columns += 1;
        self.add(good_lp::variable().binary())
    }

    pub fn push(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub fn into_program(self, objective: Expression) -> LinearProgram {
        LinearProgram {
            variables: self.variables,
            objective,
            constraints: self.constraints,
            columns: self.columns,
            integer_columns: self.integer_columns,
        }
    }
}

impl Default for ModelBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverState {
    Built,
    Solving,
    Optimal,
    Infeasible,
    SolverError,
}

impl DriverState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DriverState::Optimal | DriverState::Infeasible | DriverState::SolverError
        )
    }

    /// Legal transitions of one run.
    pub fn can_move_to(self, next: DriverState) -> bool {
        matches!(
            (self, next),
            (DriverState::Built, DriverState::Solving)
                | (DriverState::Solving, DriverState::Optimal)
                | (DriverState::Solving, DriverState::Infeasible)
                | (DriverState::Solving, DriverState::SolverError)
        )
    }
}
