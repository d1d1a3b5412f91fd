//! Placement of run-once processes ahead of the MILP.
//!
//! A process consumes a fixed power for a fixed number of slots. Its placement
//! is priced against the consumption price alone; the result then enters the
//! optimisation as an inflexible device.

use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessType {
    /// Runs as soon as possible, in one piece.
    Inflexible,
    /// May be split over any set of slots.
    Breakable,
    /// Runs in one piece, at the best moment.
    Shiftable,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptimizationDirection {
    #[default]
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub process_type: ProcessType,
    pub power_kw: f64,
    pub slots: usize,
    pub restricted: Vec<bool>,
    pub direction: OptimizationDirection,
}

impl ProcessSpec {
    fn infeasible(&self, reason: &str) -> SchedulerError {
        SchedulerError::Infeasible(format!(
            "process `{}` ({}, {} slots): {reason}",
            self.name, self.process_type, self.slots
        ))
    }

    /// Runs of unrestricted slots at least `self.slots` long, as start indices.
    fn block_starts(&self) -> Vec<usize> {
        let len = self.restricted.len();
        if self.slots > len {
            return Vec::new();
        }
        (0..=len - self.slots)
            .filter(|&s| !self.restricted[s..s + self.slots].iter().any(|&r| r))
            .collect()
    }

    /// Power per slot, or Infeasible when the process cannot be placed.
    pub fn place(&self, prices: &[f64]) -> Result<Vec<f64>, SchedulerError> {
        let len = self.restricted.len();
        let sign = match self.direction {
            OptimizationDirection::Min => 1.0,
            OptimizationDirection::Max => -1.0,
        };
        let mut power = vec![0.0; len];
        if self.slots == 0 {
            return Ok(power);
        }

        let chosen: Vec<usize> = match self.process_type {
            ProcessType::Inflexible => {
                let start = *self
                    .block_starts()
                    .first()
                    .ok_or_else(|| self.infeasible("no unrestricted block is long enough"))?;
                (start..start + self.slots).collect()
            }
            ProcessType::Breakable => {
                let free = (0..len).filter(|&j| !self.restricted[j]).collect_vec();
                if free.len() < self.slots {
                    return Err(self.infeasible("not enough unrestricted slots"));
                }
                free.into_iter()
                    .sorted_by_key(|&j| (OrderedFloat(sign * prices[j]), j))
                    .take(self.slots)
                    .collect()
            }
            ProcessType::Shiftable => {
                let start = self
                    .block_starts()
                    .into_iter()
                    .min_by_key(|&s| {
                        let cost: f64 = prices[s..s + self.slots].iter().sum();
                        (OrderedFloat(sign * cost), s)
                    })
                    .ok_or_else(|| self.infeasible("no unrestricted block is long enough"))?;
                (start..start + self.slots).collect()
            }
        };

        for j in chosen {
            power[j] = self.power_kw;
        }
        tracing::debug!(
            process = %self.name,
            kind = %self.process_type,
            slots = self.slots,
            "process placed"
        );
        Ok(power)
    }
}
