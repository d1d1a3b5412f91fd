use crate::error::ValidationError;

/// Hard per-slot limits on the summed flow of all site devices, e.g. the
/// grid connection capacity. Infinite entries mean "no limit".
#[derive(Debug, Clone, PartialEq)]
pub struct EmsBounds {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl EmsBounds {
    pub fn unbounded(len: usize) -> Self {
        Self {
            min: vec![f64::NEG_INFINITY; len],
            max: vec![f64::INFINITY; len],
        }
    }

    /// `[-capacity, capacity]` in every slot.
    pub fn symmetric(capacity: f64, len: usize) -> Self {
        Self {
            min: vec![-capacity.abs(); len],
            max: vec![capacity.abs(); len],
        }
    }

    /// Intersect with another set of limits.
    pub fn tighten(&mut self, min: &[f64], max: &[f64]) {
        for (lo, other) in self.min.iter_mut().zip(min) {
            *lo = lo.max(*other);
        }
        for (hi, other) in self.max.iter_mut().zip(max) {
            *hi = hi.min(*other);
        }
    }

    pub fn contains(&self, j: usize, flow: f64, tolerance: f64) -> bool {
        flow >= self.min[j] - tolerance && flow <= self.max[j] + tolerance
    }

    pub fn validate(&self, len: usize) -> Result<(), ValidationError> {
        if self.min.len() != len || self.max.len() != len {
            return Err(ValidationError::field(
                "site bounds",
                format!("series do not match the {len}-slot grid"),
            ));
        }
        for j in 0..len {
            if self.min[j].is_nan() || self.max[j].is_nan() || self.min[j] > self.max[j] {
                return Err(ValidationError::field(
                    "site bounds",
                    format!("empty range [{}, {}] in slot {j}", self.min[j], self.max[j]),
                ));
            }
        }
        Ok(())
    }
}
