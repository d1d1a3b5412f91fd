use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::device::DeviceId;
use crate::error::ValidationError;

/// What the baseline of a commitment refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentKind {
    /// Signed power: positive consumption, negative production.
    Flow,
    /// Stock level, e.g. a state-of-charge target.
    Stock,
}

/// How deviations are grouped over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    /// One deviation pair per slot.
    Each,
    /// One deviation pair for the whole horizon, measuring the worst excursion.
    Any,
}

/// A soft constraint: a baseline per slot plus prices for exceeding it
/// (`upwards`) and falling short of it (`downwards`).
///
/// Slots where `quantity` is `None` are not committed. A commitment without a
/// device applies to the site aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct Commitment {
    pub name: String,
    pub kind: CommitmentKind,
    pub device: Option<DeviceId>,
    pub quantity: Vec<Option<f64>>,
    pub upwards_deviation_price: Vec<f64>,
    pub downwards_deviation_price: Vec<f64>,
    pub grouping: Grouping,
}

/// Slots sharing one deviation pair, with the prices charged on it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviationGroup {
    pub slots: Vec<usize>,
    pub up_price: f64,
    pub down_price: f64,
}

impl DeviationGroup {
    /// Both deviations carry a net reward together, so they must not be
    /// active at the same time.
    pub fn needs_direction_selector(&self) -> bool {
        self.up_price + self.down_price < 0.0
    }
}

impl Commitment {
    pub fn flow(
        name: impl Into<String>,
        quantity: Vec<Option<f64>>,
        upwards_deviation_price: Vec<f64>,
        downwards_deviation_price: Vec<f64>,
        grouping: Grouping,
    ) -> Self {
        Self {
            name: name.into(),
            kind: CommitmentKind::Flow,
            device: None,
            quantity,
            upwards_deviation_price,
            downwards_deviation_price,
            grouping,
        }
    }

    pub fn stock(
        name: impl Into<String>,
        device: DeviceId,
        quantity: Vec<Option<f64>>,
        upwards_deviation_price: Vec<f64>,
        downwards_deviation_price: Vec<f64>,
        grouping: Grouping,
    ) -> Self {
        Self {
            kind: CommitmentKind::Stock,
            device: Some(device),
            ..Self::flow(
                name,
                quantity,
                upwards_deviation_price,
                downwards_deviation_price,
                grouping,
            )
        }
    }

    pub fn for_device(mut self, device: DeviceId) -> Self {
        self.device = Some(device);
        self
    }

    pub fn active_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.quantity
            .iter()
            .enumerate()
            .filter_map(|(j, q)| q.map(|_| j))
    }

    /// Deviation groups. `Each` yields one group per active slot, `Any` a
    /// single group priced at the mean of its active slots.
    pub fn groups(&self) -> Vec<DeviationGroup> {
        let active: Vec<usize> = self.active_slots().collect();
        match self.grouping {
            Grouping::Each => active
                .into_iter()
                .map(|j| DeviationGroup {
                    slots: vec![j],
                    up_price: self.upwards_deviation_price[j],
                    down_price: self.downwards_deviation_price[j],
                })
                .collect(),
            Grouping::Any if active.is_empty() => Vec::new(),
            Grouping::Any => {
                let n = active.len() as f64;
                let mean = |prices: &[f64]| active.iter().map(|&j| prices[j]).sum::<f64>() / n;
                vec![DeviationGroup {
                    up_price: mean(&self.upwards_deviation_price),
                    down_price: mean(&self.downwards_deviation_price),
                    slots: active,
                }]
            }
        }
    }

    pub fn validate(&self, len: usize) -> Result<(), ValidationError> {
        let err = |reason: String| ValidationError::commitment(&self.name, reason);
        if self.quantity.len() != len
            || self.upwards_deviation_price.len() != len
            || self.downwards_deviation_price.len() != len
        {
            return Err(err(format!("series do not match the {len}-slot grid")));
        }
        if self.kind == CommitmentKind::Stock && self.device.is_none() {
            return Err(err("stock commitments need a device".to_string()));
        }
        for j in self.active_slots() {
            let values = [
                self.quantity[j].unwrap_or_default(),
                self.upwards_deviation_price[j],
                self.downwards_deviation_price[j],
            ];
            if values.iter().any(|v| !v.is_finite()) {
                return Err(err(format!("non-finite baseline or price in slot {j}")));
            }
        }
        if self.grouping == Grouping::Any {
            for group in self.groups() {
                if group.up_price < 0.0 || group.down_price < 0.0 {
                    return Err(err(
                        "grouped deviation prices must be non-negative".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}
