use good_lp::{Expression, Variable};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::constraints::ModelHandles;
use super::types::{Assignment, SchedulingProblem};
use crate::domain::{CommitmentCost, CommitmentKind, CostBreakdown, Grouping};

/// Shape of the tie-break ramp over the horizon, `s: [0, 1] → [0, 1]`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum BiasCurve {
    #[default]
    Linear,
    Quadratic,
}

impl BiasCurve {
    pub fn shape(self, x: f64) -> f64 {
        match self {
            BiasCurve::Linear => x,
            BiasCurve::Quadratic => x * x,
        }
    }
}

/// Charge-sooner/discharge-later preference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TieBreak {
    pub enabled: bool,
    /// Largest per-kWh bias as a fraction of the commitment price spread.
    pub relative: f64,
    pub curve: BiasCurve,
}

impl Default for TieBreak {
    fn default() -> Self {
        Self {
            enabled: true,
            relative: 1e-3,
            curve: BiasCurve::Linear,
        }
    }
}

impl TieBreak {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Per-kWh bias coefficients of one slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotBias {
    pub charge: f64,
    pub discharge: f64,
}

/// Composed objective plus the data needed to split a solved value into
/// commitment costs and bias.
pub struct Objective {
    pub expression: Expression,
    /// Base bias step per kWh; zero when the tie-break is off.
    pub beta: f64,
    bias_terms: Vec<(Variable, f64)>,
}

impl Objective {
    pub fn bias_terms(&self) -> &[(Variable, f64)] {
        &self.bias_terms
    }
}

pub struct ObjectiveComposer<'a> {
    problem: &'a SchedulingProblem,
    handles: &'a ModelHandles,
    tie_break: TieBreak,
}

impl<'a> ObjectiveComposer<'a> {
    pub fn new(problem: &'a SchedulingProblem, handles: &'a ModelHandles, tie_break: TieBreak) -> Self {
        Self {
            problem,
            handles,
            tie_break,
        }
    }

    /// Spread of the per-kWh upward prices over all per-slot flow commitments.
    fn price_spread(&self) -> (f64, f64) {
        let dt = self.problem.grid.resolution_hours();
        let prices: Vec<f64> = self
            .problem
            .commitments
            .iter()
            .filter(|c| c.kind == CommitmentKind::Flow && c.grouping == Grouping::Each)
            .flat_map(|c| c.active_slots().map(move |j| c.upwards_deviation_price[j] / dt))
            .collect();
        if prices.is_empty() {
            return (0.0, 0.0);
        }
        let (lo, hi) = prices
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(*p), hi.max(*p)));
        let mean = prices.iter().sum::<f64>() / prices.len() as f64;
        (hi - lo, mean)
    }

    /// Base bias step. The largest per-kWh coefficient is `2β`, which stays
    /// within `relative` of the price spread.
    pub fn beta(&self) -> f64 {
        if !self.tie_break.enabled {
            return 0.0;
        }
        let (spread, mean) = self.price_spread();
        let scale = if spread > 0.0 { spread } else { mean.abs().max(1.0) };
        self.tie_break.relative * scale / 2.0
    }

    /// Charging costs `β·(1 + s_j)` per kWh and discharging `β·(2 − s_j)`, so
    /// charging grows dearer and discharging cheaper over time, while any
    /// charge/discharge pair still costs at least `2β`.
    pub fn slot_bias(&self, beta: f64, j: usize) -> SlotBias {
        let len = self.problem.grid.len();
        let x = if len > 1 { j as f64 / (len - 1) as f64 } else { 0.0 };
        let s = self.tie_break.curve.shape(x);
        SlotBias {
            charge: beta * (1.0 + s),
            discharge: beta * (2.0 - s),
        }
    }

    pub fn compose(&self) -> Objective {
        let mut expression = Expression::from(0.0);
        for commitment in &self.handles.commitments {
            for group in &commitment.groups {
                expression += group.up_price * group.up;
                expression += group.down_price * group.down;
            }
        }

        let beta = self.beta();
        let mut bias_terms = Vec::new();
        if beta > 0.0 {
            let dt = self.problem.grid.resolution_hours();
            for (device, vars) in self.problem.devices.iter().zip(&self.handles.devices) {
                if device.stock.is_none() || !device.prefer_charging_sooner {
                    continue;
                }
                for j in 0..self.problem.grid.len() {
                    let bias = self.slot_bias(beta, j);
                    // `down` is non-positive, so its coefficient is negated.
                    bias_terms.push((vars.up[j], bias.charge * dt));
                    bias_terms.push((vars.down[j], -bias.discharge * dt));
                }
            }
        }
        for (var, coefficient) in &bias_terms {
            expression += *coefficient * *var;
        }

        tracing::debug!(beta, bias_terms = bias_terms.len(), "objective composed");
        Objective {
            expression,
            beta,
            bias_terms,
        }
    }

    /// Split a solved assignment into per-commitment costs and bias.
    pub fn evaluate(&self, objective: &Objective, assignment: &Assignment) -> CostBreakdown {
        let value = |v: &Variable| assignment.get(v).copied().unwrap_or_default();
        let commitments: Vec<CommitmentCost> = self
            .handles
            .commitments
            .iter()
            .map(|c| {
                let (mut cost, mut up, mut down) = (0.0, 0.0, 0.0);
                for group in &c.groups {
                    let (u, d) = (value(&group.up), value(&group.down));
                    cost += group.up_price * u + group.down_price * d;
                    up += u;
                    down += d;
                }
                CommitmentCost {
                    name: c.name.clone(),
                    cost,
                    upwards_deviation: up,
                    downwards_deviation: down,
                }
            })
            .collect();
        let total = commitments.iter().map(|c| c.cost).sum::<f64>();
        let tie_break = objective
            .bias_terms
            .iter()
            .map(|(v, coefficient)| coefficient * value(v))
            .sum::<f64>();
        CostBreakdown {
            commitments,
            total,
            tie_break,
            objective: total + tie_break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Commitment, Device, DeviceId, StockModel, TimeGrid};
    use crate::optimizer::constraints::ConstraintBuilder;
    use chrono::{Duration, TimeZone, Utc};
    use rstest::rstest;

    fn problem(prices: Vec<f64>, prefer: bool) -> SchedulingProblem {
        let len = prices.len();
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let grid = TimeGrid::with_slots(start, Duration::minutes(30), len).unwrap();
        let mut battery = Device::flexible(DeviceId::new("battery"), vec![-1.0; len], vec![1.0; len])
            .with_stock(StockModel::ideal(0.0, len));
        battery.prefer_charging_sooner = prefer;
        let up: Vec<f64> = prices.iter().map(|p| p * 0.5).collect();
        let down: Vec<f64> = up.iter().map(|p| -p).collect();
        let energy = Commitment::flow("energy", vec![Some(0.0); len], up, down, Grouping::Each);
        SchedulingProblem::new(grid, vec![battery], vec![energy])
    }

    #[test]
    fn test_beta_scales_with_spread() {
        let p = problem(vec![0.1, 0.3, 0.2], true);
        let built = ConstraintBuilder::new(&p).build().unwrap();
        let composer = ObjectiveComposer::new(&p, &built.handles, TieBreak::default());
        // Spread of per-kWh prices is 0.2.
        assert!((composer.beta() - 1e-4).abs() < 1e-15);
        let disabled = ObjectiveComposer::new(&p, &built.handles, TieBreak::disabled());
        assert_eq!(disabled.beta(), 0.0);
    }

    #[test]
    fn test_flat_prices_fall_back_to_mean() {
        let p = problem(vec![0.0; 4], true);
        let built = ConstraintBuilder::new(&p).build().unwrap();
        let composer = ObjectiveComposer::new(&p, &built.handles, TieBreak::default());
        assert!((composer.beta() - 0.5e-3).abs() < 1e-15);
    }

    #[rstest]
    #[case(BiasCurve::Linear)]
    #[case(BiasCurve::Quadratic)]
    fn test_bias_orders_slots_and_never_rewards_cycles(#[case] curve: BiasCurve) {
        let p = problem(vec![0.2; 5], true);
        let built = ConstraintBuilder::new(&p).build().unwrap();
        let tie_break = TieBreak { curve, ..TieBreak::default() };
        let composer = ObjectiveComposer::new(&p, &built.handles, tie_break);
        let beta = composer.beta();
        for j in 1..5 {
            let (a, b) = (composer.slot_bias(beta, j - 1), composer.slot_bias(beta, j));
            assert!(b.charge > a.charge);
            assert!(b.discharge < a.discharge);
        }
        for i in 0..5 {
            for k in 0..5 {
                let cycle = composer.slot_bias(beta, i).charge + composer.slot_bias(beta, k).discharge;
                assert!(cycle >= 2.0 * beta - 1e-15);
            }
        }
    }

    #[test]
    fn test_bias_only_for_opted_in_storage() {
        let p = problem(vec![0.1, 0.2], false);
        let built = ConstraintBuilder::new(&p).build().unwrap();
        let objective = ObjectiveComposer::new(&p, &built.handles, TieBreak::default()).compose();
        assert!(objective.bias_terms().is_empty());

        let p = problem(vec![0.1, 0.2], true);
        let built = ConstraintBuilder::new(&p).build().unwrap();
        let objective = ObjectiveComposer::new(&p, &built.handles, TieBreak::default()).compose();
        assert_eq!(objective.bias_terms().len(), 4);
    }

    #[test]
    fn test_evaluate_splits_costs() {
        let p = problem(vec![0.2, 0.4], true);
        let built = ConstraintBuilder::new(&p).build().unwrap();
        let composer = ObjectiveComposer::new(&p, &built.handles, TieBreak::default());
        let objective = composer.compose();

        let mut assignment = Assignment::new();
        let groups = &built.handles.commitments[0].groups;
        assignment.insert(groups[0].up, 1.0);
        assignment.insert(groups[1].down, 1.0);
        assignment.insert(built.handles.devices[0].up[0], 1.0);
        assignment.insert(built.handles.devices[0].down[1], -1.0);

        let costs = composer.evaluate(&objective, &assignment);
        // 0.1 for charging, -0.2 for discharging.
        assert!((costs.total - (-0.1)).abs() < 1e-12);
        assert!(costs.tie_break > 0.0);
        assert!((costs.objective - costs.total - costs.tie_break).abs() < 1e-12);
        assert!((costs.commitments[0].upwards_deviation - 1.0).abs() < 1e-12);
    }
}
