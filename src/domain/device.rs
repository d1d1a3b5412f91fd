use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::ValidationError;

/// Retention factors this close to 1 are treated as lossless.
const LOSSLESS_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the per-slot retention `ε` is applied in the stock recurrence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum EfficiencyMode {
    /// No decay at all.
    Perfect,
    /// Change first, then decay: `(S + ΔS)·ε`.
    Left,
    /// Decay first, then change: `S·ε + ΔS`.
    Right,
    /// Continuous decay during the slot: `S·ε + ΔS·(ε−1)/ln ε`.
    #[default]
    Linear,
}

/// `(ε − 1) / ln ε`, continuous at `ε = 1` where it tends to 1.
///
/// Near 1 the quotient is evaluated from its series in `x = ε − 1` to
/// avoid cancelling a tiny numerator against a tiny logarithm.
pub fn linear_loss_factor(retention: f64) -> f64 {
    let x = retention - 1.0;
    if x.abs() < 1e-4 {
        1.0 + x / 2.0 - x * x / 12.0 + x * x * x / 24.0
    } else {
        x / retention.ln()
    }
}

impl EfficiencyMode {
    /// Coefficients `(a, b)` of `S(j) = a·S(j−1) + b·ΔS(j)`.
    pub fn recurrence(self, retention: f64) -> (f64, f64) {
        if (retention - 1.0).abs() <= LOSSLESS_EPSILON {
            return (1.0, 1.0);
        }
        match self {
            EfficiencyMode::Perfect => (1.0, 1.0),
            EfficiencyMode::Left => (retention, retention),
            EfficiencyMode::Right => (retention, 1.0),
            EfficiencyMode::Linear => (retention, linear_loss_factor(retention)),
        }
    }
}

/// Stock dynamics of a storage-like device. All series are per slot.
///
/// `min`, `max` and `equals` are relative to `initial`, i.e. they bound
/// `S(j) − S(−1)`. Infinite bounds are allowed and mean "unbounded".
#[derive(Debug, Clone, PartialEq)]
pub struct StockModel {
    pub initial: f64,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub equals: Vec<Option<f64>>,
    pub eta_up: Vec<f64>,
    pub eta_down: Vec<f64>,
    pub retention: Vec<f64>,
    /// Exogenous stock change in kWh per slot.
    pub delta: Vec<f64>,
    pub mode: EfficiencyMode,
}

impl StockModel {
    /// Lossless, unbounded stock of `len` slots starting at `initial`.
    pub fn ideal(initial: f64, len: usize) -> Self {
        Self {
            initial,
            min: vec![f64::NEG_INFINITY; len],
            max: vec![f64::INFINITY; len],
            equals: vec![None; len],
            eta_up: vec![1.0; len],
            eta_down: vec![1.0; len],
            retention: vec![1.0; len],
            delta: vec![0.0; len],
            mode: EfficiencyMode::Perfect,
        }
    }

    pub fn coefficients(&self, j: usize) -> (f64, f64) {
        self.mode.recurrence(self.retention[j])
    }

    /// Efficiency-adjusted stock change of slot `j`, before decay.
    pub fn delta_stock(&self, j: usize, up: f64, down: f64, dt_hours: f64) -> f64 {
        (down / self.eta_down[j] + up * self.eta_up[j]) * dt_hours + self.delta[j]
    }

    /// Absolute stock at the end of every slot for a signed flow series.
    pub fn replay(&self, flows: &[f64], dt_hours: f64) -> Vec<f64> {
        let mut stock = self.initial;
        flows
            .iter()
            .enumerate()
            .map(|(j, &p)| {
                let (a, b) = self.coefficients(j);
                let change = self.delta_stock(j, p.max(0.0), p.min(0.0), dt_hours);
                stock = a * stock + b * change;
                stock
            })
            .collect()
    }

    /// Slots whose replayed stock leaves its bounds by more than `tolerance`.
    pub fn violations(&self, stocks: &[f64], tolerance: f64) -> Vec<usize> {
        stocks
            .iter()
            .enumerate()
            .filter(|(j, s)| {
                let rel = *s - self.initial;
                let pinned = self.equals[*j].map_or(false, |e| (rel - e).abs() > tolerance);
                rel < self.min[*j] - tolerance || rel > self.max[*j] + tolerance || pinned
            })
            .map(|(j, _)| j)
            .collect()
    }

    fn validate(&self, device: &DeviceId, len: usize) -> Result<(), ValidationError> {
        let err = |reason: String| ValidationError::device(device.as_str(), reason);
        let lengths = [
            self.min.len(),
            self.max.len(),
            self.equals.len(),
            self.eta_up.len(),
            self.eta_down.len(),
            self.retention.len(),
            self.delta.len(),
        ];
        if lengths.iter().any(|&l| l != len) {
            return Err(err(format!("stock series do not match the {len}-slot grid")));
        }
        if !self.initial.is_finite() {
            return Err(err("initial stock must be finite".to_string()));
        }
        for j in 0..len {
            if self.min[j] > self.max[j] {
                return Err(err(format!(
                    "stock minimum {} exceeds maximum {} in slot {j}",
                    self.min[j], self.max[j]
                )));
            }
            for (name, eta) in [("charging", self.eta_up[j]), ("discharging", self.eta_down[j])] {
                if !(eta > 0.0 && eta <= 1.0) {
                    return Err(err(format!("{name} efficiency {eta} outside (0, 1] in slot {j}")));
                }
            }
            let r = self.retention[j];
            if !(r > 0.0 && r <= 1.0) {
                return Err(err(format!("storage efficiency {r} outside (0, 1] in slot {j}")));
            }
            if !self.delta[j].is_finite() || self.equals[j].is_some_and(|e| !e.is_finite()) {
                return Err(err(format!("non-finite stock input in slot {j}")));
            }
        }
        Ok(())
    }
}

/// One controllable or fixed flow source/sink.
///
/// Flow is signed: positive is consumption (charging), negative production.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub power_min: Vec<f64>,
    pub power_max: Vec<f64>,
    pub stock: Option<StockModel>,
    /// Whether the device's flow counts towards the site aggregate.
    pub ems: bool,
    pub prefer_charging_sooner: bool,
}

impl Device {
    /// Flexible device with symmetric-or-not power bounds and no stock.
    pub fn flexible(id: DeviceId, power_min: Vec<f64>, power_max: Vec<f64>) -> Self {
        Self {
            id,
            power_min,
            power_max,
            stock: None,
            ems: true,
            prefer_charging_sooner: false,
        }
    }

    /// Fixed load/generation following `power` exactly.
    pub fn inflexible(id: DeviceId, power: Vec<f64>) -> Self {
        Self::flexible(id, power.clone(), power)
    }

    pub fn with_stock(mut self, stock: StockModel) -> Self {
        self.stock = Some(stock);
        self
    }

    pub fn len(&self) -> usize {
        self.power_min.len()
    }

    pub fn is_empty(&self) -> bool {
        self.power_min.is_empty()
    }

    /// Both flow halves can be nonzero in slot `j`.
    pub fn is_bidirectional(&self, j: usize) -> bool {
        self.power_max[j] > 0.0 && self.power_min[j] < 0.0
    }

    /// Largest feasible flow magnitude over the horizon.
    pub fn flow_magnitude_bound(&self) -> f64 {
        self.power_min
            .iter()
            .chain(&self.power_max)
            .fold(0.0_f64, |acc, p| acc.max(p.abs()))
    }

    /// Selector constant for mutual exclusion: strictly above any feasible
    /// magnitude of either flow half.
    pub fn big_m(&self, margin: f64) -> f64 {
        self.flow_magnitude_bound() * (1.0 + margin) + 1.0
    }

    /// Upper bound on `|S(j)|` reachable from the device's own flows.
    pub fn stock_magnitude_bound(&self, dt_hours: f64) -> f64 {
        let Some(stock) = &self.stock else {
            return 0.0;
        };
        (0..self.len()).fold(stock.initial.abs(), |acc, j| {
            let inflow = self.power_max[j].max(0.0) * stock.eta_up[j];
            let outflow = (-self.power_min[j]).max(0.0) / stock.eta_down[j];
            acc + inflow.max(outflow) * dt_hours + stock.delta[j].abs()
        })
    }

    pub fn validate(&self, len: usize) -> Result<(), ValidationError> {
        let err = |reason: String| ValidationError::device(self.id.as_str(), reason);
        if self.power_min.len() != len || self.power_max.len() != len {
            return Err(err(format!("power bounds do not match the {len}-slot grid")));
        }
        for j in 0..len {
            let (lo, hi) = (self.power_min[j], self.power_max[j]);
            if !lo.is_finite() || !hi.is_finite() {
                return Err(err(format!("power bounds must be finite (slot {j})")));
            }
            if lo > hi {
                return Err(err(format!(
                    "minimum power {lo} exceeds maximum power {hi} in slot {j}"
                )));
            }
        }
        if let Some(stock) = &self.stock {
            stock.validate(&self.id, len)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn battery(mode: EfficiencyMode, retention: f64) -> StockModel {
        StockModel {
            retention: vec![retention; 3],
            eta_up: vec![0.9; 3],
            eta_down: vec![0.9; 3],
            mode,
            ..StockModel::ideal(10.0, 3)
        }
    }

    #[rstest]
    #[case(EfficiencyMode::Perfect, (1.0, 1.0))]
    #[case(EfficiencyMode::Left, (0.9, 0.9))]
    #[case(EfficiencyMode::Right, (0.9, 1.0))]
    #[case(EfficiencyMode::Linear, (0.9, (0.9_f64 - 1.0) / 0.9_f64.ln()))]
    fn test_recurrence_coefficients(#[case] mode: EfficiencyMode, #[case] expected: (f64, f64)) {
        let (a, b) = mode.recurrence(0.9);
        assert!((a - expected.0).abs() < 1e-12);
        assert!((b - expected.1).abs() < 1e-12);
    }

    #[rstest]
    #[case(EfficiencyMode::Left)]
    #[case(EfficiencyMode::Right)]
    #[case(EfficiencyMode::Linear)]
    fn test_lossless_retention_degenerates_to_perfect(#[case] mode: EfficiencyMode) {
        assert_eq!(mode.recurrence(1.0), (1.0, 1.0));
    }

    #[rstest]
    #[case(1.0 - 0.9999e-4)]
    #[case(1.0 - 0.5e-4)]
    #[case(1.0 - 1e-6)]
    fn test_linear_factor_series_matches_closed_form(#[case] retention: f64) {
        let exact = (retention - 1.0) / retention.ln();
        assert!((linear_loss_factor(retention) - exact).abs() < 1e-12);
    }

    #[test]
    fn test_linear_factor_is_continuous_at_one() {
        assert!((linear_loss_factor(1.0) - 1.0).abs() < 1e-15);
        // The factor has slope 1/2 near one, so neighbours across the series
        // cut-off differ by about half their distance.
        let (below, above) = (1.0 - 1.0001e-4, 1.0 - 0.9999e-4);
        let jump = linear_loss_factor(above) - linear_loss_factor(below);
        assert!((jump - 0.5 * (above - below)).abs() < 1e-11);
    }

    #[test]
    fn test_replay_applies_efficiencies() {
        let stock = battery(EfficiencyMode::Right, 1.0);
        // Charge 10 kW for 1 h at 90 %, then discharge 9 kW at 90 %.
        let s = stock.replay(&[10.0, -9.0, 0.0], 1.0);
        assert!((s[0] - 19.0).abs() < 1e-9);
        assert!((s[1] - 9.0).abs() < 1e-9);
        assert!((s[2] - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_replay_left_decays_after_change() {
        let stock = battery(EfficiencyMode::Left, 0.5);
        let s = stock.replay(&[0.0, 0.0, 0.0], 1.0);
        assert_eq!(s, vec![5.0, 2.5, 1.25]);
    }

    #[test]
    fn test_violations_are_relative_to_initial() {
        let mut stock = StockModel::ideal(5.0, 2);
        stock.min = vec![-5.0, -5.0];
        stock.max = vec![5.0, 5.0];
        assert!(stock.violations(&[0.0, 10.0], 1e-6).is_empty());
        assert_eq!(stock.violations(&[-0.1, 10.1], 1e-6), vec![0, 1]);
    }

    #[test]
    fn test_device_validation() {
        let id = DeviceId::new("battery");
        let device = Device::flexible(id.clone(), vec![-5.0; 2], vec![5.0; 2]);
        assert!(device.validate(2).is_ok());
        assert!(device.validate(3).is_err());

        let inverted = Device::flexible(id.clone(), vec![1.0], vec![0.0]);
        assert!(matches!(inverted.validate(1), Err(ValidationError::Device { .. })));

        let lossy = Device::flexible(id, vec![-5.0], vec![5.0]).with_stock(StockModel {
            eta_up: vec![0.0],
            ..StockModel::ideal(0.0, 1)
        });
        assert!(lossy.validate(1).is_err());
    }

    #[test]
    fn test_big_m_exceeds_bounds() {
        let device = Device::flexible(DeviceId::new("d"), vec![-7.0, -3.0], vec![2.0, 4.0]);
        assert_eq!(device.flow_magnitude_bound(), 7.0);
        assert!(device.big_m(0.1) > 7.0);
        assert!(device.is_bidirectional(0));
        let zero = Device::inflexible(DeviceId::new("z"), vec![0.0]);
        assert!(!zero.is_bidirectional(0));
        assert_eq!(zero.big_m(0.1), 1.0);
    }

    proptest! {
        #[test]
        fn prop_perfect_replay_is_cumulative(
            flows in prop::collection::vec(-10.0f64..10.0, 1..24),
            initial in 0.0f64..50.0,
        ) {
            let stock = StockModel::ideal(initial, flows.len());
            let s = stock.replay(&flows, 0.25);
            let total: f64 = flows.iter().sum::<f64>() * 0.25;
            prop_assert!((s[s.len() - 1] - initial - total).abs() < 1e-9);
        }

        #[test]
        fn prop_lossy_modes_never_exceed_lossless(
            flows in prop::collection::vec(0.0f64..10.0, 1..12),
            retention in 0.5f64..1.0,
        ) {
            let lossless = StockModel::ideal(20.0, flows.len()).replay(&flows, 1.0);
            for mode in [EfficiencyMode::Left, EfficiencyMode::Right, EfficiencyMode::Linear] {
                let model = StockModel {
                    retention: vec![retention; flows.len()],
                    mode,
                    ..StockModel::ideal(20.0, flows.len())
                };
                let lossy = model.replay(&flows, 1.0);
                for (l, p) in lossy.iter().zip(&lossless) {
                    prop_assert!(*l <= *p + 1e-9);
                }
            }
        }

        #[test]
        fn prop_linear_factor_between_retention_and_one(retention in 0.01f64..0.9999) {
            let f = linear_loss_factor(retention);
            prop_assert!(f >= retention - 1e-12 && f <= 1.0 + 1e-12);
        }
    }
}
