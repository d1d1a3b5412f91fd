use chrono::{DateTime, Duration, FixedOffset, Utc};
use chrono_tz::Tz;

use crate::error::ValidationError;

/// Contiguous, equal-length time slots covering `[start, start + len·resolution)`.
///
/// Every device, commitment and price series of one run is indexed into the
/// same grid. Stock values are indexed by slot too, and refer to the stock at
/// the *end* of that slot; the stock at the grid start is the initial stock.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeGrid {
    start: DateTime<Utc>,
    resolution: Duration,
    len: usize,
    timezone: Tz,
}

impl TimeGrid {
    /// Grid over `[start, end)`; the span must be a whole number of slots.
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Duration,
        timezone: Tz,
    ) -> Result<Self, ValidationError> {
        if resolution <= Duration::zero() {
            return Err(ValidationError::TimeGrid(format!(
                "resolution must be positive, got {resolution}"
            )));
        }
        if end <= start {
            return Err(ValidationError::TimeGrid(format!(
                "end {end} is not after start {start}"
            )));
        }
        let span = (end - start).num_seconds();
        let step = resolution.num_seconds();
        if step == 0 || span % step != 0 {
            return Err(ValidationError::TimeGrid(format!(
                "horizon of {span}s is not a multiple of the {step}s resolution"
            )));
        }
        Ok(Self {
            start,
            resolution,
            len: (span / step) as usize,
            timezone,
        })
    }

    /// Grid of `len` slots in UTC.
    pub fn with_slots(
        start: DateTime<Utc>,
        resolution: Duration,
        len: usize,
    ) -> Result<Self, ValidationError> {
        if len == 0 {
            return Err(ValidationError::TimeGrid("grid has no slots".to_string()));
        }
        Self::new(start, start + resolution * len as i32, resolution, Tz::UTC)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.slot_start(self.len)
    }

    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Slot length in hours, the Δt of the stock equation.
    pub fn resolution_hours(&self) -> f64 {
        self.resolution.num_seconds() as f64 / 3600.0
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn slot_start(&self, j: usize) -> DateTime<Utc> {
        self.start + self.resolution * j as i32
    }

    pub fn slot_end(&self, j: usize) -> DateTime<Utc> {
        self.slot_start(j + 1)
    }

    /// Slots overlapping `[from, until)`.
    pub fn overlapping(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Vec<usize> {
        (0..self.len)
            .filter(|&j| self.slot_start(j) < until && self.slot_end(j) > from)
            .collect()
    }

    /// Render an instant in the grid's timezone.
    pub fn local(&self, t: DateTime<Utc>) -> DateTime<FixedOffset> {
        t.with_timezone(&self.timezone).fixed_offset()
    }
}
