//! Per-slot inputs as they arrive in flex-models and flex-contexts.
//!
//! A series is resolved onto the [`TimeGrid`] by step-hold: a slot takes the
//! value that covers its start instant. State series (SOC minima, targets)
//! are resolved onto stock indices instead, where index `j` is the instant at
//! the end of slot `j`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::quantity::{parse_iso_duration, Dimension, Quantity, QuantityValue};
use super::time_grid::TimeGrid;
use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeriesSpec {
    Constant(QuantityValue),
    Segments(Vec<Segment>),
    Aligned(AlignedSeries),
}

/// One value over an interval (`start` + `end` or `duration`), or at one
/// instant (`datetime`, state series only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    pub value: QuantityValue,
}

/// A regularly sampled series with its own start and resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedSeries {
    pub start: String,
    pub resolution: String,
    pub values: Vec<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub timezone: Option<Tz>,
}

/// Parse an instant; naive timestamps are read in `tz`.
pub fn parse_instant(text: &str, tz: Tz) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(t.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M"))
        .map_err(|e| ValidationError::quantity(text, format!("not a datetime: {e}")))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| ValidationError::quantity(text, format!("does not exist in {tz}")))
}

impl Segment {
    fn bounds(&self, tz: Tz) -> Result<(DateTime<Utc>, DateTime<Utc>), ValidationError> {
        if let Some(at) = &self.datetime {
            let t = parse_instant(at, tz)?;
            return Ok((t, t));
        }
        let start = self
            .start
            .as_deref()
            .ok_or_else(|| ValidationError::field("start", "segment needs `datetime` or `start`"))?;
        let start = parse_instant(start, tz)?;
        let end = match (&self.end, &self.duration) {
            (Some(end), _) => parse_instant(end, tz)?,
            (None, Some(d)) => start + parse_iso_duration(d)?,
            (None, None) => {
                return Err(ValidationError::field(
                    "end",
                    "segment needs `end` or `duration`",
                ))
            }
        };
        if end < start {
            return Err(ValidationError::field("end", "segment ends before it starts"));
        }
        Ok((start, end))
    }
}

impl AlignedSeries {
    fn scaled_values(&self) -> Result<(Vec<f64>, Dimension, Option<String>), ValidationError> {
        let Some(unit) = &self.unit else {
            return Ok((self.values.clone(), Dimension::Dimensionless, None));
        };
        let probe: Quantity = format!("1 {unit}").parse()?;
        let values = self.values.iter().map(|v| v * probe.value).collect();
        Ok((values, probe.dimension, probe.currency))
    }
}

impl SeriesSpec {
    pub fn constant(value: f64) -> Self {
        SeriesSpec::Constant(QuantityValue::Number(value))
    }

    /// Per-slot values; `None` where the series does not cover a slot.
    pub fn flow_values(
        &self,
        grid: &TimeGrid,
        field: &str,
        expected: Dimension,
        reference: Option<f64>,
    ) -> Result<Vec<Option<f64>>, ValidationError> {
        let wrap = |e: ValidationError| ValidationError::field(field, e.to_string());
        let mut out = vec![None; grid.len()];
        match self {
            SeriesSpec::Constant(v) => {
                let v = v.resolve(field, expected, reference)?;
                out.iter_mut().for_each(|slot| *slot = Some(v));
            }
            SeriesSpec::Segments(segments) => {
                for segment in segments {
                    let (from, until) = segment.bounds(grid.timezone()).map_err(wrap)?;
                    let v = segment.value.resolve(field, expected, reference)?;
                    for j in 0..grid.len() {
                        let t = grid.slot_start(j);
                        let covers = if from == until { t == from } else { t >= from && t < until };
                        if covers {
                            out[j] = Some(v);
                        }
                    }
                }
            }
            SeriesSpec::Aligned(series) => {
                let tz = series.timezone.unwrap_or(grid.timezone());
                let start = parse_instant(&series.start, tz).map_err(wrap)?;
                let step = parse_iso_duration(&series.resolution).map_err(wrap)?;
                if step.num_seconds() <= 0 {
                    return Err(ValidationError::field(field, "series resolution must be positive"));
                }
                let (values, dim, _) = series.scaled_values().map_err(wrap)?;
                for (j, slot) in out.iter_mut().enumerate() {
                    let t = grid.slot_start(j);
                    if t < start {
                        continue;
                    }
                    let k = ((t - start).num_seconds() / step.num_seconds()) as usize;
                    if let Some(raw) = values.get(k) {
                        let q = Quantity { value: *raw, dimension: dim, currency: None };
                        *slot = Some(q.to_canonical(expected, reference).map_err(wrap)?);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Per-stock-index values; index `j` is the instant at the end of slot `j`.
    /// Interval segments cover every such instant in `[start, end]`.
    pub fn state_values(
        &self,
        grid: &TimeGrid,
        field: &str,
        expected: Dimension,
        reference: Option<f64>,
    ) -> Result<Vec<Option<f64>>, ValidationError> {
        let wrap = |e: ValidationError| ValidationError::field(field, e.to_string());
        match self {
            SeriesSpec::Segments(segments) => {
                let mut out = vec![None; grid.len()];
                for segment in segments {
                    let (from, until) = segment.bounds(grid.timezone()).map_err(wrap)?;
                    let v = segment.value.resolve(field, expected, reference)?;
                    let mut hit = false;
                    for (j, slot) in out.iter_mut().enumerate() {
                        let t = grid.slot_end(j);
                        if t >= from && t <= until {
                            *slot = Some(v);
                            hit = true;
                        }
                    }
                    if !hit {
                        tracing::debug!(field, %from, %until, "state segment lies outside the horizon");
                    }
                }
                Ok(out)
            }
            // Constant and aligned state series sample at the end of each slot.
            SeriesSpec::Constant(_) => self.flow_values(grid, field, expected, reference),
            SeriesSpec::Aligned(_) => {
                let shifted = TimeGrid::new(
                    grid.start() + grid.resolution(),
                    grid.end() + grid.resolution(),
                    grid.resolution(),
                    grid.timezone(),
                )?;
                self.flow_values(&shifted, field, expected, reference)
            }
        }
    }

    /// Values for every slot; an uncovered slot is a configuration error.
    pub fn required(
        &self,
        grid: &TimeGrid,
        field: &str,
        expected: Dimension,
    ) -> Result<Vec<f64>, ValidationError> {
        self.flow_values(grid, field, expected, None)?
            .into_iter()
            .enumerate()
            .map(|(j, v)| {
                v.ok_or_else(|| {
                    ValidationError::field(
                        field,
                        format!("no value for the slot starting {}", grid.local(grid.slot_start(j))),
                    )
                })
            })
            .collect()
    }

    /// Values for every slot, filling gaps with `default`.
    pub fn values_or(
        &self,
        grid: &TimeGrid,
        field: &str,
        expected: Dimension,
        default: f64,
    ) -> Result<Vec<f64>, ValidationError> {
        Ok(self
            .flow_values(grid, field, expected, None)?
            .into_iter()
            .map(|v| v.unwrap_or(default))
            .collect())
    }

    /// Dimension of the first value that states a unit.
    pub fn dimension(&self) -> Result<Dimension, ValidationError> {
        let stated = match self {
            SeriesSpec::Constant(v) => v.parse()?.dimension,
            SeriesSpec::Segments(segments) => {
                let mut dim = Dimension::Dimensionless;
                for segment in segments {
                    dim = segment.value.parse()?.dimension;
                    if dim != Dimension::Dimensionless {
                        break;
                    }
                }
                dim
            }
            SeriesSpec::Aligned(series) => series.scaled_values()?.1,
        };
        Ok(stated)
    }

    /// Currency named anywhere in the series, if any.
    pub fn currency(&self) -> Option<String> {
        match self {
            SeriesSpec::Constant(v) => v.currency(),
            SeriesSpec::Segments(segments) => segments.iter().find_map(|s| s.value.currency()),
            SeriesSpec::Aligned(series) => series.scaled_values().ok().and_then(|(_, _, c)| c),
        }
    }
}

impl From<f64> for SeriesSpec {
    fn from(v: f64) -> Self {
        SeriesSpec::constant(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grid() -> TimeGrid {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        TimeGrid::with_slots(start, Duration::hours(1), 4).unwrap()
    }

    fn parse(json: &str) -> SeriesSpec {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_constant_forms() {
        let g = grid();
        assert_eq!(parse("0.3").required(&g, "p", Dimension::EnergyPrice).unwrap(), vec![0.3; 4]);
        assert_eq!(
            parse(r#""300 EUR/MWh""#).required(&g, "p", Dimension::EnergyPrice).unwrap(),
            vec![0.3; 4]
        );
    }

    #[test]
    fn test_segments_step_hold_and_gaps() {
        let g = grid();
        let s = parse(
            r#"[{"start": "2025-01-01T01:00:00+00:00", "duration": "PT2H", "value": "2 kW"}]"#,
        );
        assert_eq!(
            s.flow_values(&g, "gain", Dimension::Power, None).unwrap(),
            vec![None, Some(2.0), Some(2.0), None]
        );
        assert!(s.required(&g, "gain", Dimension::Power).is_err());
        assert_eq!(s.values_or(&g, "gain", Dimension::Power, 0.0).unwrap(), vec![0.0, 2.0, 2.0, 0.0]);
    }

    #[test]
    fn test_aligned_series_converts_units() {
        let g = grid();
        let s = parse(
            r#"{"start": "2025-01-01T00:00:00Z", "resolution": "PT30M",
                "values": [100, 100, 200, 200, 300, 300, 400, 400], "unit": "EUR/MWh"}"#,
        );
        let v = s.required(&g, "price", Dimension::EnergyPrice).unwrap();
        assert_eq!(v, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(s.currency().as_deref(), Some("EUR"));
    }

    #[test]
    fn test_naive_times_use_grid_timezone() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let g = TimeGrid::new(start, start + Duration::hours(2), Duration::hours(1), chrono_tz::Europe::Amsterdam)
            .unwrap();
        // 02:00 Amsterdam is 01:00 UTC.
        let s = parse(r#"[{"start": "2025-01-01T02:00", "end": "2025-01-01T03:00", "value": 1}]"#);
        assert_eq!(s.flow_values(&g, "x", Dimension::Power, None).unwrap(), vec![None, Some(1.0)]);
    }

    #[test]
    fn test_dimension_of_first_unit() {
        assert_eq!(parse("0.3").dimension().unwrap(), Dimension::Dimensionless);
        assert_eq!(parse(r#""12 EUR/kW""#).dimension().unwrap(), Dimension::PowerPrice);
        let s = parse(
            r#"[{"start": "2025-01-01T00:00:00Z", "duration": "PT1H", "value": 1},
                {"start": "2025-01-01T01:00:00Z", "duration": "PT1H", "value": "0.2 EUR/kWh"}]"#,
        );
        assert_eq!(s.dimension().unwrap(), Dimension::EnergyPrice);
    }

    #[test]
    fn test_state_values_index_slot_ends() {
        let g = grid();
        let s = parse(
            r#"[{"datetime": "2025-01-01T04:00:00Z", "value": "80%"},
                {"start": "2025-01-01T01:00:00Z", "end": "2025-01-01T02:00:00Z", "value": 5}]"#,
        );
        let v = s.state_values(&g, "soc-minima", Dimension::Energy, Some(10.0)).unwrap();
        assert_eq!(v, vec![Some(5.0), Some(5.0), None, Some(8.0)]);
    }
}
