//! Translation of devices, site bounds and commitments into linear rows.
//!
//! Per device and slot the flow is split into a consumption half
//! `up ∈ [0, max(P_max, 0)]` and a production half `down ∈ [min(P_min, 0), 0]`.
//! Bidirectional slots get a binary selector so the two halves are never
//! active together. Storage devices get one explicit stock column per slot,
//! linked by the recurrence of their efficiency mode.

use good_lp::{constraint, variable, Expression, Variable};
use tracing::{debug, info};

use super::types::{ModelBuffer, SchedulingProblem};
use crate::domain::{Commitment, CommitmentKind, Device, Grouping};
use crate::error::ValidationError;

pub const DEFAULT_BIG_M_MARGIN: f64 = 0.1;

/// Columns of one device.
#[derive(Debug, Clone)]
pub struct DeviceVariables {
    pub up: Vec<Variable>,
    pub down: Vec<Variable>,
    pub selector: Vec<Option<Variable>>,
    /// Absolute stock at the end of each slot.
    pub stock: Option<Vec<Variable>>,
}

impl DeviceVariables {
    pub fn flow(&self, j: usize) -> Expression {
        Expression::from(self.up[j]) + self.down[j]
    }
}

/// One deviation pair and the slots it is linked to.
#[derive(Debug, Clone)]
pub struct GroupVariables {
    pub slots: Vec<usize>,
    pub up: Variable,
    pub down: Variable,
    pub up_price: f64,
    pub down_price: f64,
    pub selector: Option<Variable>,
}

#[derive(Debug, Clone)]
pub struct CommitmentVariables {
    pub name: String,
    pub groups: Vec<GroupVariables>,
}

/// Column handles needed to compose the objective and read a solution back.
#[derive(Debug, Clone)]
pub struct ModelHandles {
    pub devices: Vec<DeviceVariables>,
    pub commitments: Vec<CommitmentVariables>,
    /// Indices of devices that count towards the site aggregate.
    pub ems_members: Vec<usize>,
}

impl ModelHandles {
    pub fn ems_flow(&self, j: usize) -> Expression {
        self.ems_members
            .iter()
            .map(|&d| self.devices[d].flow(j))
            .sum()
    }
}

pub struct BuiltModel {
    pub buffer: ModelBuffer,
    pub handles: ModelHandles,
}

pub struct ConstraintBuilder<'a> {
    problem: &'a SchedulingProblem,
    big_m_margin: f64,
}

impl<'a> ConstraintBuilder<'a> {
    pub fn new(problem: &'a SchedulingProblem) -> Self {
        Self {
            problem,
            big_m_margin: DEFAULT_BIG_M_MARGIN,
        }
    }

    pub fn with_big_m_margin(mut self, margin: f64) -> Self {
        self.big_m_margin = margin;
        self
    }

    pub fn build(self) -> Result<BuiltModel, ValidationError> {
        self.problem.validate()?;
        if !(self.big_m_margin >= 0.0 && self.big_m_margin.is_finite()) {
            return Err(ValidationError::field(
                "big_m_margin",
                format!("must be a non-negative number, got {}", self.big_m_margin),
            ));
        }

        let mut buffer = ModelBuffer::new();
        let devices = self
            .problem
            .devices
            .iter()
            .map(|d| self.add_device(&mut buffer, d))
            .collect();
        let ems_members = self
            .problem
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.ems)
            .map(|(i, _)| i)
            .collect();
        let mut handles = ModelHandles {
            devices,
            commitments: Vec::with_capacity(self.problem.commitments.len()),
            ems_members,
        };

        self.add_ems_bounds(&mut buffer, &handles);
        for commitment in &self.problem.commitments {
            let vars = self.add_commitment(&mut buffer, &handles, commitment);
            handles.commitments.push(vars);
        }

        info!(
            slots = self.problem.grid.len(),
            devices = self.problem.devices.len(),
            commitments = self.problem.commitments.len(),
            columns = buffer.columns.len(),
            binaries = buffer.integer_columns,
            rows = buffer.constraints.len(),
            "model built"
        );
        Ok(BuiltModel { buffer, handles })
    }

    fn add_device(&self, buffer: &mut ModelBuffer, device: &Device) -> DeviceVariables {
        let len = self.problem.grid.len();
        let dt = self.problem.grid.resolution_hours();
        let big_m = device.big_m(self.big_m_margin);
        let label = device.id.as_str().replace(char::is_whitespace, "_");
        let mut vars = DeviceVariables {
            up: Vec::with_capacity(len),
            down: Vec::with_capacity(len),
            selector: Vec::with_capacity(len),
            stock: None,
        };

        for j in 0..len {
            let (lo, hi) = (device.power_min[j], device.power_max[j]);
            let up = buffer.add(
                variable()
                    .min(0.0)
                    .max(hi.max(0.0))
                    .name(format!("{label}_up_{j}")),
            );
            let down = buffer.add(
                variable()
                    .min(lo.min(0.0))
                    .max(0.0)
                    .name(format!("{label}_down_{j}")),
            );
            // Strictly one-sided bands need the aggregate bound too.
            if lo > 0.0 {
                buffer.push(constraint!(up + down >= lo));
            }
            if hi < 0.0 {
                buffer.push(constraint!(up + down <= hi));
            }
            let selector = device.is_bidirectional(j).then(|| {
                let sigma = buffer.add_binary();
                buffer.push(constraint!(up <= big_m * sigma));
                buffer.push(constraint!(big_m * sigma - down <= big_m));
                sigma
            });
            vars.up.push(up);
            vars.down.push(down);
            vars.selector.push(selector);
        }

        if let Some(stock) = &device.stock {
            let mut columns = Vec::with_capacity(len);
            let mut previous = Expression::from(stock.initial);
            for j in 0..len {
                let mut definition = variable().name(format!("{label}_stock_{j}"));
                if stock.min[j].is_finite() {
                    definition = definition.min(stock.initial + stock.min[j]);
                }
                if stock.max[j].is_finite() {
                    definition = definition.max(stock.initial + stock.max[j]);
                }
                let s = buffer.add(definition);
                let (a, b) = stock.coefficients(j);
                let change = (dt * stock.eta_up[j]) * vars.up[j]
                    + (dt / stock.eta_down[j]) * vars.down[j]
                    + stock.delta[j];
                buffer.push(constraint!(s == previous * a + change * b));
                if let Some(target) = stock.equals[j] {
                    buffer.push(constraint!(s == stock.initial + target));
                }
                previous = Expression::from(s);
                columns.push(s);
            }
            vars.stock = Some(columns);
        }

        debug!(
            device = %device.id,
            big_m,
            selectors = vars.selector.iter().flatten().count(),
            storage = device.stock.is_some(),
            "device columns added"
        );
        vars
    }

    fn add_ems_bounds(&self, buffer: &mut ModelBuffer, handles: &ModelHandles) {
        if handles.ems_members.is_empty() {
            return;
        }
        let bounds = &self.problem.ems;
        for j in 0..self.problem.grid.len() {
            if bounds.min[j].is_finite() {
                buffer.push(constraint!(handles.ems_flow(j) >= bounds.min[j]));
            }
            if bounds.max[j].is_finite() {
                buffer.push(constraint!(handles.ems_flow(j) <= bounds.max[j]));
            }
        }
    }

    /// The quantity a commitment measures in slot `j`.
    fn scope(&self, handles: &ModelHandles, commitment: &Commitment, j: usize) -> Expression {
        let device = commitment
            .device
            .as_ref()
            .and_then(|id| self.problem.device_index(id.as_str()));
        match (commitment.kind, device) {
            (CommitmentKind::Flow, Some(d)) => handles.devices[d].flow(j),
            (CommitmentKind::Flow, None) => handles.ems_flow(j),
            (CommitmentKind::Stock, Some(d)) => handles.devices[d]
                .stock
                .as_ref()
                .map(|s| Expression::from(s[j]))
                .unwrap_or_else(|| Expression::from(0.0)),
            // Rejected by validation.
            (CommitmentKind::Stock, None) => Expression::from(0.0),
        }
    }

    /// Largest magnitude the scope of `commitment` can take.
    fn scope_bound(&self, commitment: &Commitment) -> f64 {
        let dt = self.problem.grid.resolution_hours();
        let device = commitment
            .device
            .as_ref()
            .and_then(|id| self.problem.device_index(id.as_str()))
            .map(|d| &self.problem.devices[d]);
        match (commitment.kind, device) {
            (CommitmentKind::Flow, Some(d)) => d.flow_magnitude_bound(),
            (CommitmentKind::Flow, None) => self
                .problem
                .devices
                .iter()
                .filter(|d| d.ems)
                .map(Device::flow_magnitude_bound)
                .sum(),
            (CommitmentKind::Stock, Some(d)) => d.stock_magnitude_bound(dt),
            (CommitmentKind::Stock, None) => 0.0,
        }
    }

    fn add_commitment(
        &self,
        buffer: &mut ModelBuffer,
        handles: &ModelHandles,
        commitment: &Commitment,
    ) -> CommitmentVariables {
        let scope_bound = self.scope_bound(commitment);
        let label = commitment.name.replace(char::is_whitespace, "_");
        let groups = commitment
            .groups()
            .into_iter()
            .enumerate()
            .map(|(g, group)| {
                let up = buffer.add(variable().min(0.0).name(format!("{label}_up_{g}")));
                let down = buffer.add(variable().min(0.0).name(format!("{label}_down_{g}")));

                for &j in &group.slots {
                    let q = commitment.quantity[j].unwrap_or_default();
                    let scope = self.scope(handles, commitment, j);
                    match commitment.grouping {
                        Grouping::Each => {
                            buffer.push(constraint!(scope - up + down == q));
                        }
                        Grouping::Any => {
                            buffer.push(constraint!(scope.clone() - up <= q));
                            buffer.push(constraint!(scope + down >= q));
                        }
                    }
                }

                let selector = (commitment.grouping == Grouping::Each
                    && group.needs_direction_selector())
                .then(|| {
                    let q_max = group
                        .slots
                        .iter()
                        .map(|&j| commitment.quantity[j].unwrap_or_default().abs())
                        .fold(0.0_f64, f64::max);
                    let m = (scope_bound + q_max) * (1.0 + self.big_m_margin) + 1.0;
                    let tau = buffer.add_binary();
                    buffer.push(constraint!(up <= m * tau));
                    buffer.push(constraint!(m * tau + down <= m));
                    tau
                });

                GroupVariables {
                    slots: group.slots,
                    up,
                    down,
                    up_price: group.up_price,
                    down_price: group.down_price,
                    selector,
                }
            })
            .collect::<Vec<_>>();

        debug!(
            commitment = %commitment.name,
            kind = %commitment.kind,
            grouping = %commitment.grouping,
            groups = groups.len(),
            "commitment linked"
        );
        CommitmentVariables {
            name: commitment.name.clone(),
            groups,
        }
    }
}
