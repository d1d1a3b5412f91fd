use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::quantity::parse_iso_duration;
use crate::domain::series::parse_instant;
use crate::domain::{EfficiencyMode, QuantityValue, SeriesSpec, TimeGrid};
use crate::error::ValidationError;

use super::process::{OptimizationDirection, ProcessType};

/// A closed-open interval during which a device may not operate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

impl TimeWindow {
    pub fn bounds(&self, grid: &TimeGrid) -> Result<(DateTime<Utc>, DateTime<Utc>), ValidationError> {
        let start = parse_instant(&self.start, grid.timezone())?;
        let end = match (&self.end, &self.duration) {
            (Some(end), _) => parse_instant(end, grid.timezone())?,
            (None, Some(d)) => start + parse_iso_duration(d)?,
            (None, None) => {
                return Err(ValidationError::field(
                    "time-restrictions",
                    "a window needs `end` or `duration`",
                ))
            }
        };
        Ok((start, end))
    }
}

/// Per-slot mask of restricted slots.
pub fn restricted_slots(
    windows: &[TimeWindow],
    grid: &TimeGrid,
) -> Result<Vec<bool>, ValidationError> {
    let mut mask = vec![false; grid.len()];
    for window in windows {
        let (from, until) = window.bounds(grid)?;
        for j in grid.overlapping(from, until) {
            mask[j] = true;
        }
    }
    Ok(mask)
}

/// Flex-model of a storage-like device (battery, EV charger, heat buffer).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StorageFlexModel {
    pub soc_at_start: Option<QuantityValue>,
    pub soc_min: Option<QuantityValue>,
    pub soc_max: Option<QuantityValue>,
    pub storage_capacity: Option<QuantityValue>,
    pub soc_minima: Option<SeriesSpec>,
    pub soc_maxima: Option<SeriesSpec>,
    pub soc_targets: Option<SeriesSpec>,
    pub soc_minima_breach_price: Option<QuantityValue>,
    pub soc_maxima_breach_price: Option<QuantityValue>,
    /// Worth of each kWh still stored at the end of the horizon. Defaults to
    /// the consumption price of the last slot.
    pub stored_energy_price: Option<QuantityValue>,
    pub power_capacity: Option<SeriesSpec>,
    pub consumption_capacity: Option<SeriesSpec>,
    pub production_capacity: Option<SeriesSpec>,
    pub charging_efficiency: Option<SeriesSpec>,
    pub discharging_efficiency: Option<SeriesSpec>,
    pub roundtrip_efficiency: Option<QuantityValue>,
    pub storage_efficiency: Option<SeriesSpec>,
    pub efficiency_mode: Option<EfficiencyMode>,
    pub soc_gain: Option<SeriesSpec>,
    pub soc_usage: Option<SeriesSpec>,
    pub prefer_charging_sooner: Option<bool>,
    #[serde(default)]
    pub time_restrictions: Vec<TimeWindow>,
}

/// Flex-model of a load that runs once at fixed power for a fixed duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProcessFlexModel {
    pub process_type: ProcessType,
    pub power: QuantityValue,
    pub duration: String,
    #[serde(default)]
    pub optimization_direction: OptimizationDirection,
    #[serde(default)]
    pub time_restrictions: Vec<TimeWindow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FlexModel {
    Storage(Box<StorageFlexModel>),
    Process(ProcessFlexModel),
}

impl<'de> Deserialize<'de> for FlexModel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let value = serde_json::Value::deserialize(deserializer)?;
        let is_process = value
            .as_object()
            .is_some_and(|fields| fields.contains_key("process-type"));
        if is_process {
            serde_json::from_value(value)
                .map(FlexModel::Process)
                .map_err(|e| D::Error::custom(format!("process flex-model: {e}")))
        } else {
            serde_json::from_value(value)
                .map(|m| FlexModel::Storage(Box::new(m)))
                .map_err(|e| D::Error::custom(format!("storage flex-model: {e}")))
        }
    }
}
