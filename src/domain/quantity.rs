use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::ValidationError;

// ============================================================================
// Dimensions and canonical units
// ============================================================================

/// Physical dimension of a parsed quantity.
///
/// Canonical units: kW for power, kWh for energy, currency per kWh for energy
/// prices, currency per kW for power prices. Ratios are fractions (0.9, not 90).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Dimension {
    Dimensionless,
    Ratio,
    Power,
    Energy,
    EnergyPrice,
    PowerPrice,
}

/// A magnitude in canonical units together with its dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub dimension: Dimension,
    pub currency: Option<String>,
}

impl Quantity {
    pub fn number(value: f64) -> Self {
        Self {
            value,
            dimension: Dimension::Dimensionless,
            currency: None,
        }
    }

    /// Value in the canonical unit of `expected`.
    ///
    /// Bare numbers are taken as already canonical. A percentage resolves
    /// against `reference` (e.g. the storage capacity) when one is given.
    pub fn to_canonical(
        &self,
        expected: Dimension,
        reference: Option<f64>,
    ) -> Result<f64, ValidationError> {
        match (self.dimension, expected) {
            (have, want) if have == want => Ok(self.value),
            (Dimension::Dimensionless, _) => Ok(self.value),
            (Dimension::Ratio, Dimension::Power | Dimension::Energy) => match reference {
                Some(r) => Ok(self.value * r),
                None => Err(ValidationError::quantity(
                    self.to_string(),
                    format!("a percentage needs a reference {expected} to resolve against"),
                )),
            },
            (have, want) => Err(ValidationError::quantity(
                self.to_string(),
                format!("expected a {want} quantity, got {have}"),
            )),
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let currency = self.currency.as_deref().unwrap_or("");
        match self.dimension {
            Dimension::Dimensionless => write!(f, "{}", self.value),
            Dimension::Ratio => write!(f, "{}%", self.value * 100.0),
            Dimension::Power => write!(f, "{} kW", self.value),
            Dimension::Energy => write!(f, "{} kWh", self.value),
            Dimension::EnergyPrice => write!(f, "{} {currency}/kWh", self.value),
            Dimension::PowerPrice => write!(f, "{} {currency}/kW", self.value),
        }
    }
}

fn power_factor(unit: &str) -> Option<f64> {
    match unit {
        "W" => Some(1e-3),
        "kW" => Some(1.0),
        "MW" => Some(1e3),
        "GW" => Some(1e6),
        _ => None,
    }
}

fn energy_factor(unit: &str) -> Option<f64> {
    match unit {
        "Wh" => Some(1e-3),
        "kWh" => Some(1.0),
        "MWh" => Some(1e3),
        "GWh" => Some(1e6),
        _ => None,
    }
}

/// Longest prefix of `s` that parses as a finite number, and the rest.
fn split_number(s: &str) -> Option<(f64, &str)> {
    let mut cut = s.len();
    loop {
        if s.is_char_boundary(cut) {
            if let Ok(v) = s[..cut].trim().parse::<f64>() {
                return v.is_finite().then_some((v, s[cut..].trim()));
            }
        }
        if cut == 0 {
            return None;
        }
        cut -= 1;
    }
}

impl FromStr for Quantity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let (value, unit) = split_number(text)
            .ok_or_else(|| ValidationError::quantity(text, "no leading number"))?;

        if unit.is_empty() {
            return Ok(Quantity::number(value));
        }
        if unit == "%" {
            return Ok(Quantity {
                value: value / 100.0,
                dimension: Dimension::Ratio,
                currency: None,
            });
        }
        if let Some(k) = power_factor(unit) {
            return Ok(Quantity {
                value: value * k,
                dimension: Dimension::Power,
                currency: None,
            });
        }
        if let Some(k) = energy_factor(unit) {
            return Ok(Quantity {
                value: value * k,
                dimension: Dimension::Energy,
                currency: None,
            });
        }
        if let Some((currency, per)) = unit.split_once('/') {
            let currency = currency.trim();
            if currency.is_empty() || currency.chars().any(|c| c.is_ascii_digit()) {
                return Err(ValidationError::quantity(text, "missing currency"));
            }
            let per = per.trim();
            let (dimension, k) = if let Some(k) = energy_factor(per) {
                (Dimension::EnergyPrice, k)
            } else if let Some(k) = power_factor(per) {
                (Dimension::PowerPrice, k)
            } else {
                return Err(ValidationError::quantity(
                    text,
                    format!("cannot price per `{per}`"),
                ));
            };
            return Ok(Quantity {
                value: value / k,
                dimension,
                currency: Some(currency.to_string()),
            });
        }
        Err(ValidationError::quantity(
            text,
            format!("unknown unit `{unit}`"),
        ))
    }
}

// ============================================================================
// Serde-facing scalar
// ============================================================================

/// A scalar field as written in a flex-model or flex-context: either a bare
/// number in canonical units or a quantity string such as `"5 kW"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuantityValue {
    Number(f64),
    Text(String),
}

impl QuantityValue {
    pub fn parse(&self) -> Result<Quantity, ValidationError> {
        match self {
            QuantityValue::Number(v) => Ok(Quantity::number(*v)),
            QuantityValue::Text(s) => s.parse(),
        }
    }

    /// Canonical magnitude, with the field name attached to any error.
    pub fn resolve(
        &self,
        field: &str,
        expected: Dimension,
        reference: Option<f64>,
    ) -> Result<f64, ValidationError> {
        self.parse()
            .and_then(|q| q.to_canonical(expected, reference))
            .map_err(|e| ValidationError::field(field, e.to_string()))
    }

    pub fn currency(&self) -> Option<String> {
        match self {
            QuantityValue::Number(_) => None,
            QuantityValue::Text(s) => s.parse::<Quantity>().ok().and_then(|q| q.currency),
        }
    }
}

impl From<f64> for QuantityValue {
    fn from(v: f64) -> Self {
        QuantityValue::Number(v)
    }
}

impl From<&str> for QuantityValue {
    fn from(s: &str) -> Self {
        QuantityValue::Text(s.to_string())
    }
}

// ============================================================================
// ISO 8601 durations
// ============================================================================

/// Parse `PnDTnHnMnS`-style durations (`PT15M`, `PT1H30M`, `P1D`).
/// Years and months are rejected since their length is calendar dependent.
pub fn parse_iso_duration(s: &str) -> Result<Duration, ValidationError> {
    let text = s.trim();
    let bad = |reason: &str| ValidationError::quantity(text, reason.to_string());
    let body = text
        .strip_prefix('P')
        .ok_or_else(|| bad("ISO 8601 duration must start with `P`"))?;
    if body.is_empty() {
        return Err(bad("empty duration"));
    }

    let mut seconds = 0f64;
    let mut parts = 0;
    let mut in_time = false;
    let mut number = String::new();
    for c in body.chars() {
        match c {
            'T' if !in_time && number.is_empty() => in_time = true,
            '0'..='9' | '.' => number.push(c),
            unit => {
                let n: f64 = number
                    .parse()
                    .map_err(|_| bad("missing number before designator"))?;
                number.clear();
                parts += 1;
                seconds += n * match (in_time, unit) {
                    (false, 'W') => 7.0 * 86_400.0,
                    (false, 'D') => 86_400.0,
                    (true, 'H') => 3_600.0,
                    (true, 'M') => 60.0,
                    (true, 'S') => 1.0,
                    (false, 'Y' | 'M') => return Err(bad("calendar units are not supported")),
                    _ => return Err(bad("unknown designator")),
                };
            }
        }
    }
    if !number.is_empty() {
        return Err(bad("trailing number without designator"));
    }
    if parts == 0 {
        return Err(bad("duration has no components"));
    }
    Ok(Duration::milliseconds((seconds * 1000.0).round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("5 kW", 5.0, Dimension::Power)]
    #[case("0.5 MW", 500.0, Dimension::Power)]
    #[case("2500W", 2.5, Dimension::Power)]
    #[case("10 kWh", 10.0, Dimension::Energy)]
    #[case("0.01 MWh", 10.0, Dimension::Energy)]
    #[case("90%", 0.9, Dimension::Ratio)]
    #[case("0.25 EUR/kWh", 0.25, Dimension::EnergyPrice)]
    #[case("250 EUR/MWh", 0.25, Dimension::EnergyPrice)]
    #[case("12 EUR/kW", 12.0, Dimension::PowerPrice)]
    #[case("-3", -3.0, Dimension::Dimensionless)]
    fn test_parse_quantities(#[case] text: &str, #[case] value: f64, #[case] dim: Dimension) {
        let q: Quantity = text.parse().unwrap();
        assert!((q.value - value).abs() < 1e-9, "{text} -> {}", q.value);
        assert_eq!(q.dimension, dim);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("kW".parse::<Quantity>().is_err());
        assert!("5 parsecs".parse::<Quantity>().is_err());
        assert!("5 EUR/parsec".parse::<Quantity>().is_err());
        assert!("inf kW".parse::<Quantity>().is_err());
    }

    #[test]
    fn test_dimension_mismatch_names_field() {
        let v = QuantityValue::from("5 kWh");
        let err = v.resolve("power-capacity", Dimension::Power, None).unwrap_err();
        assert!(err.to_string().contains("power-capacity"));
    }

    #[test]
    fn test_percentage_resolves_against_reference() {
        let v = QuantityValue::from("25%");
        assert_eq!(v.resolve("soc-min", Dimension::Energy, Some(40.0)).unwrap(), 10.0);
        assert!(v.resolve("soc-min", Dimension::Energy, None).is_err());
    }

    #[test]
    fn test_currency_is_reported() {
        assert_eq!(QuantityValue::from("0.3 EUR/kWh").currency().as_deref(), Some("EUR"));
        assert_eq!(QuantityValue::from(0.3).currency(), None);
    }

    #[rstest]
    #[case("PT15M", 15 * 60)]
    #[case("PT1H", 3600)]
    #[case("PT1H30M", 5400)]
    #[case("P1D", 86_400)]
    #[case("P1DT2H", 93_600)]
    #[case("PT90S", 90)]
    fn test_iso_durations(#[case] text: &str, #[case] seconds: i64) {
        assert_eq!(parse_iso_duration(text).unwrap().num_seconds(), seconds);
    }

    #[test]
    fn test_iso_duration_rejects_calendar_units() {
        assert!(parse_iso_duration("P1M").is_err());
        assert!(parse_iso_duration("15M").is_err());
        assert!(parse_iso_duration("PT").is_err());
    }

    proptest! {
        #[test]
        fn prop_kilowatt_strings_roundtrip(v in -1.0e6f64..1.0e6) {
            let q: Quantity = format!("{v} kW").parse().unwrap();
            prop_assert!((q.value - v).abs() <= 1e-9 * v.abs().max(1.0));
        }

        #[test]
        fn prop_megawatt_hours_scale(v in 0.0f64..1.0e3) {
            let q: Quantity = format!("{v} MWh").parse().unwrap();
            prop_assert!((q.value - v * 1000.0).abs() <= 1e-6 * v.max(1.0));
        }
    }
}
