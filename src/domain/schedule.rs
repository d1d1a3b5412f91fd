use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::device::DeviceId;

/// Flows below this magnitude are reported as idle.
const IDLE_KW: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Optimal,
    Infeasible,
    SolverError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub status: ScheduleStatus,
    pub created_at: DateTime<FixedOffset>,
    pub valid_from: DateTime<FixedOffset>,
    pub valid_until: DateTime<FixedOffset>,
    pub devices: Vec<DeviceSchedule>,
    /// Summed flow of all site devices per slot.
    pub ems_power_kw: Vec<f64>,
    pub costs: CostBreakdown,
    pub optimizer_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSchedule {
    pub device: DeviceId,
    pub entries: Vec<ScheduleEntry>,
    /// Stock at the end of each slot, for storage devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_kwh: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub time_start: DateTime<FixedOffset>,
    pub time_end: DateTime<FixedOffset>,
    pub target_power_kw: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub commitments: Vec<CommitmentCost>,
    /// Deviation cost without the tie-break bias.
    pub total: f64,
    pub tie_break: f64,
    /// What the solver minimised: `total + tie_break`.
    pub objective: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentCost {
    pub name: String,
    pub cost: f64,
    pub upwards_deviation: f64,
    pub downwards_deviation: f64,
}

impl ScheduleEntry {
    pub fn reason_for(power_kw: f64, fixed: bool) -> &'static str {
        match (fixed, power_kw) {
            (true, _) => "fixed",
            (false, p) if p > IDLE_KW => "milp:charge",
            (false, p) if p < -IDLE_KW => "milp:discharge",
            _ => "milp:idle",
        }
    }
}

impl DeviceSchedule {
    pub fn power_kw(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.target_power_kw).collect()
    }

    pub fn power_at(&self, t: DateTime<FixedOffset>) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| t >= e.time_start && t < e.time_end)
            .map(|e| e.target_power_kw)
    }
}

impl Schedule {
    pub fn device(&self, name: &str) -> Option<&DeviceSchedule> {
        self.devices.iter().find(|d| d.device.as_str() == name)
    }

    pub fn power_at(&self, name: &str, t: DateTime<FixedOffset>) -> Option<f64> {
        self.device(name).and_then(|d| d.power_at(t))
    }
}
