use serde::{Deserialize, Serialize};

use crate::domain::{CommitmentKind, Grouping, SeriesSpec};

/// Site-level business inputs: tariffs, capacities and their prices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FlexContext {
    pub consumption_price: Option<SeriesSpec>,
    pub production_price: Option<SeriesSpec>,
    pub site_power_capacity: Option<SeriesSpec>,
    pub site_consumption_capacity: Option<SeriesSpec>,
    pub site_production_capacity: Option<SeriesSpec>,
    pub site_consumption_breach_price: Option<SeriesSpec>,
    pub site_production_breach_price: Option<SeriesSpec>,
    pub site_peak_consumption: Option<SeriesSpec>,
    pub site_peak_consumption_price: Option<SeriesSpec>,
    pub site_peak_production: Option<SeriesSpec>,
    pub site_peak_production_price: Option<SeriesSpec>,
    #[serde(default)]
    pub inflexible_device_sensors: Vec<InflexibleDevice>,
    #[serde(default)]
    pub commitments: Vec<RawCommitment>,
}

/// Fixed load or generation known only as a power series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InflexibleDevice {
    pub name: String,
    pub power: SeriesSpec,
}

/// A commitment given directly by the caller.
///
/// Prices stated per kWh are scaled by the slot length for flow commitments;
/// bare numbers are used as objective coefficients as they are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawCommitment {
    pub name: String,
    pub baseline: SeriesSpec,
    #[serde(default = "zero")]
    pub up_price: SeriesSpec,
    #[serde(default = "zero")]
    pub down_price: SeriesSpec,
    #[serde(rename = "type", default = "each")]
    pub grouping: Grouping,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "flow")]
    pub class: CommitmentKind,
}

fn zero() -> SeriesSpec {
    SeriesSpec::constant(0.0)
}

fn each() -> Grouping {
    Grouping::Each
}

fn flow() -> CommitmentKind {
    CommitmentKind::Flow
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_context() {
        let context: FlexContext = serde_json::from_str(
            r#"{
                "consumption-price": "0.30 EUR/kWh",
                "site-power-capacity": "25 kW",
                "site-consumption-capacity": "20 kW",
                "site-consumption-breach-price": "100 EUR/kW",
                "site-peak-consumption-price": "12 EUR/kW",
                "inflexible-device-sensors": [{"name": "pv", "power": "-4 kW"}],
                "commitments": [{"name": "contract", "baseline": 2, "up-price": 1, "type": "any"}]
            }"#,
        )
        .unwrap();
        assert!(context.production_price.is_none());
        assert_eq!(context.inflexible_device_sensors[0].name, "pv");
        let raw = &context.commitments[0];
        assert_eq!(raw.grouping, Grouping::Any);
        assert_eq!(raw.class, CommitmentKind::Flow);
        assert_eq!(raw.down_price, SeriesSpec::constant(0.0));
    }

    #[test]
    fn test_typos_are_rejected() {
        assert!(serde_json::from_str::<FlexContext>(r#"{"consumption-prize": 0.3}"#).is_err());
    }
}
