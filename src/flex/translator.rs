//! Translation of a scheduling request (flex-models plus flex-context) into a
//! [`SchedulingProblem`].
//!
//! Every tariff, capacity and preference becomes either a hard bound or a
//! priced commitment. Prices stated per kWh are scaled by the slot length so
//! that every objective coefficient is "per kW deviation for one slot".

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::domain::quantity::parse_iso_duration;
use crate::domain::series::parse_instant;
use crate::domain::{
    Commitment, CommitmentKind, Device, DeviceId, Dimension, EmsBounds, Grouping, SeriesSpec,
    StockModel, TimeGrid,
};
use crate::error::{SchedulerError, ValidationError};
use crate::optimizer::SchedulingProblem;

use super::flex_context::{FlexContext, RawCommitment};
use super::flex_model::{restricted_slots, FlexModel, ProcessFlexModel, StorageFlexModel};
use super::process::ProcessSpec;

/// One scheduling request: a horizon, the devices to plan and the site context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ScheduleRequest {
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    pub resolution: String,
    #[serde(default)]
    pub timezone: Option<Tz>,
    pub devices: Vec<DeviceRequest>,
    #[serde(default)]
    pub flex_context: FlexContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeviceRequest {
    pub name: String,
    pub flex_model: FlexModel,
}

impl ScheduleRequest {
    pub fn grid(&self) -> Result<TimeGrid, ValidationError> {
        let tz = self.timezone.unwrap_or(Tz::UTC);
        let start = parse_instant(&self.start, tz)?;
        let end = match (&self.end, &self.duration) {
            (Some(end), _) => parse_instant(end, tz)?,
            (None, Some(duration)) => start + parse_iso_duration(duration)?,
            (None, None) => {
                return Err(ValidationError::field("end", "give `end` or `duration`"));
            }
        };
        TimeGrid::new(start, end, parse_iso_duration(&self.resolution)?, tz)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranslatorSettings {
    /// Fallback for flex-models that do not set `prefer-charging-sooner`.
    pub prefer_charging_sooner: bool,
}

impl Default for TranslatorSettings {
    fn default() -> Self {
        Self {
            prefer_charging_sooner: true,
        }
    }
}

/// Build the problem for `request`. Process devices are placed here, so an
/// unplaceable process already fails as Infeasible.
pub fn translate(
    request: &ScheduleRequest,
    settings: &TranslatorSettings,
) -> Result<SchedulingProblem, SchedulerError> {
    let grid = request.grid()?;
    let translator = Translator {
        grid: &grid,
        context: &request.flex_context,
        settings,
    };

    let prices = translator.energy_prices()?;
    let mut devices = Vec::with_capacity(request.devices.len());
    let mut commitments = vec![translator.energy_commitment(&prices)];

    for device in &request.devices {
        match &device.flex_model {
            FlexModel::Storage(model) => {
                let (storage, soft) = translator.storage_device(&device.name, model, &prices)?;
                devices.push(storage);
                commitments.extend(soft);
            }
            FlexModel::Process(model) => {
                devices.push(translator.process_device(&device.name, model, &prices.consumption)?);
            }
        }
    }
    for sensor in &request.flex_context.inflexible_device_sensors {
        let field = format!("inflexible-device-sensors.{}", sensor.name);
        let power = sensor.power.required(&grid, &field, Dimension::Power)?;
        devices.push(Device::inflexible(DeviceId::new(&sensor.name), power));
    }

    let (ems, site_commitments) = translator.site_limits()?;
    commitments.extend(site_commitments);
    for raw in &request.flex_context.commitments {
        commitments.push(translator.raw_commitment(raw)?);
    }

    tracing::info!(
        slots = grid.len(),
        devices = devices.len(),
        commitments = commitments.len(),
        "flex request translated"
    );
    let problem = SchedulingProblem::new(grid, devices, commitments).with_ems(ems);
    problem.validate()?;
    Ok(problem)
}

struct EnergyPrices {
    consumption: Vec<f64>,
    production: Vec<f64>,
}

struct Translator<'a> {
    grid: &'a TimeGrid,
    context: &'a FlexContext,
    settings: &'a TranslatorSettings,
}

impl Translator<'_> {
    fn dt(&self) -> f64 {
        self.grid.resolution_hours()
    }

    fn len(&self) -> usize {
        self.grid.len()
    }

    fn scaled(&self, values: &[f64], factor: f64) -> Vec<f64> {
        values.iter().map(|v| v * factor * self.dt()).collect()
    }

    fn energy_prices(&self) -> Result<EnergyPrices, ValidationError> {
        let consumption_spec = self.context.consumption_price.as_ref().ok_or_else(|| {
            ValidationError::field("consumption-price", "a consumption price is required")
        })?;
        let consumption =
            consumption_spec.required(self.grid, "consumption-price", Dimension::EnergyPrice)?;

        let production = match &self.context.production_price {
            Some(spec) => {
                if let (Some(c), Some(p)) = (consumption_spec.currency(), spec.currency()) {
                    if c != p {
                        return Err(ValidationError::field(
                            "production-price",
                            format!("currency {p} differs from the consumption price currency {c}"),
                        ));
                    }
                }
                spec.required(self.grid, "production-price", Dimension::EnergyPrice)?
            }
            None => {
                tracing::info!("no production-price given, using the consumption price");
                consumption.clone()
            }
        };
        Ok(EnergyPrices {
            consumption,
            production,
        })
    }

    /// Net site exchange priced at the tariffs: importing costs the
    /// consumption price, exporting earns the production price.
    fn energy_commitment(&self, prices: &EnergyPrices) -> Commitment {
        Commitment::flow(
            "energy",
            vec![Some(0.0); self.len()],
            self.scaled(&prices.consumption, 1.0),
            self.scaled(&prices.production, -1.0),
            Grouping::Each,
        )
    }

    fn optional_series(
        &self,
        spec: &Option<SeriesSpec>,
        field: &str,
        dimension: Dimension,
    ) -> Result<Option<Vec<f64>>, ValidationError> {
        spec.as_ref()
            .map(|s| s.required(self.grid, field, dimension))
            .transpose()
    }

    fn site_limits(&self) -> Result<(EmsBounds, Vec<Commitment>), ValidationError> {
        let len = self.len();
        let ctx = self.context;
        let mut ems = EmsBounds::unbounded(len);
        let mut commitments = Vec::new();
        let unbounded_min = vec![f64::NEG_INFINITY; len];
        let unbounded_max = vec![f64::INFINITY; len];

        if let Some(cap) =
            self.optional_series(&ctx.site_power_capacity, "site-power-capacity", Dimension::Power)?
        {
            let negated: Vec<f64> = cap.iter().map(|c| -c.abs()).collect();
            let cap: Vec<f64> = cap.iter().map(|c| c.abs()).collect();
            ems.tighten(&negated, &cap);
        }

        let consumption_cap = self.optional_series(
            &ctx.site_consumption_capacity,
            "site-consumption-capacity",
            Dimension::Power,
        )?;
        let consumption_breach = self.optional_series(
            &ctx.site_consumption_breach_price,
            "site-consumption-breach-price",
            Dimension::PowerPrice,
        )?;
        match (consumption_cap, consumption_breach) {
            (Some(cap), Some(price)) => {
                let baseline: Vec<Option<f64>> = cap.into_iter().map(Some).collect();
                commitments.extend(self.breach_pair("consumption", baseline, &price, true));
            }
            (Some(cap), None) => ems.tighten(&unbounded_min, &cap),
            (None, Some(_)) => {
                tracing::warn!("site-consumption-breach-price given without a capacity, ignoring it")
            }
            (None, None) => {}
        }

        let production_cap = self.optional_series(
            &ctx.site_production_capacity,
            "site-production-capacity",
            Dimension::Power,
        )?;
        let production_breach = self.optional_series(
            &ctx.site_production_breach_price,
            "site-production-breach-price",
            Dimension::PowerPrice,
        )?;
        match (production_cap, production_breach) {
            (Some(cap), Some(price)) => {
                let baseline: Vec<Option<f64>> = cap.into_iter().map(|c| Some(-c)).collect();
                commitments.extend(self.breach_pair("production", baseline, &price, false));
            }
            (Some(cap), None) => {
                let negated: Vec<f64> = cap.iter().map(|c| -c).collect();
                ems.tighten(&negated, &unbounded_max);
            }
            (None, Some(_)) => {
                tracing::warn!("site-production-breach-price given without a capacity, ignoring it")
            }
            (None, None) => {}
        }

        if let Some(price) = self.optional_series(
            &ctx.site_peak_consumption_price,
            "site-peak-consumption-price",
            Dimension::PowerPrice,
        )? {
            let peak = self
                .optional_series(&ctx.site_peak_consumption, "site-peak-consumption", Dimension::Power)?
                .unwrap_or_else(|| vec![0.0; len]);
            commitments.push(Commitment::flow(
                "consumption peak",
                peak.into_iter().map(Some).collect(),
                price,
                vec![0.0; len],
                Grouping::Any,
            ));
        }
        if let Some(price) = self.optional_series(
            &ctx.site_peak_production_price,
            "site-peak-production-price",
            Dimension::PowerPrice,
        )? {
            let peak = self
                .optional_series(&ctx.site_peak_production, "site-peak-production", Dimension::Power)?
                .unwrap_or_else(|| vec![0.0; len]);
            commitments.push(Commitment::flow(
                "production peak",
                peak.into_iter().map(|p| Some(-p)).collect(),
                vec![0.0; len],
                price,
                Grouping::Any,
            ));
        }
        Ok((ems, commitments))
    }

    /// `any <kind> breach` prices the largest excursion once; `all <kind>
    /// breaches` prices every slot's excursion as energy.
    fn breach_pair(
        &self,
        kind: &str,
        baseline: Vec<Option<f64>>,
        price: &[f64],
        upwards: bool,
    ) -> [Commitment; 2] {
        let len = self.len();
        let zero = vec![0.0; len];
        let per_slot = self.scaled(price, 1.0);
        let (any_up, any_down, all_up, all_down) = if upwards {
            (price.to_vec(), zero.clone(), per_slot, zero)
        } else {
            (zero.clone(), price.to_vec(), zero, per_slot)
        };
        [
            Commitment::flow(
                format!("any {kind} breach"),
                baseline.clone(),
                any_up,
                any_down,
                Grouping::Any,
            ),
            Commitment::flow(
                format!("all {kind} breaches"),
                baseline,
                all_up,
                all_down,
                Grouping::Each,
            ),
        ]
    }

    fn storage_device(
        &self,
        name: &str,
        model: &StorageFlexModel,
        prices: &EnergyPrices,
    ) -> Result<(Device, Vec<Commitment>), ValidationError> {
        let grid = self.grid;
        let len = self.len();
        let dt = self.dt();
        let id = DeviceId::new(name);
        let field = |key: &str| format!("{name}.{key}");

        let capacity = match (&model.storage_capacity, &model.soc_max) {
            (Some(c), _) => Some(c.resolve(&field("storage-capacity"), Dimension::Energy, None)?),
            (None, Some(max)) => Some(max.resolve(&field("soc-max"), Dimension::Energy, None)?),
            (None, None) => None,
        };
        let resolve = |value: &Option<crate::domain::QuantityValue>, key: &str| {
            value
                .as_ref()
                .map(|v| v.resolve(&field(key), Dimension::Energy, capacity))
                .transpose()
        };
        let initial = match resolve(&model.soc_at_start, "soc-at-start")? {
            Some(soc) => soc,
            None => {
                tracing::warn!(device = name, "no soc-at-start given, assuming an empty storage");
                0.0
            }
        };
        let soc_min = resolve(&model.soc_min, "soc-min")?.unwrap_or(0.0);
        let soc_max = resolve(&model.soc_max, "soc-max")?
            .or(capacity)
            .unwrap_or(f64::INFINITY);

        let state = |spec: &Option<SeriesSpec>, key: &str| -> Result<Vec<Option<f64>>, ValidationError> {
            match spec {
                Some(s) => s.state_values(grid, &field(key), Dimension::Energy, capacity),
                None => Ok(vec![None; len]),
            }
        };
        let minima = state(&model.soc_minima, "soc-minima")?;
        let maxima = state(&model.soc_maxima, "soc-maxima")?;
        let targets = state(&model.soc_targets, "soc-targets")?;

        let minima_price = model
            .soc_minima_breach_price
            .as_ref()
            .map(|p| p.resolve(&field("soc-minima-breach-price"), Dimension::EnergyPrice, None))
            .transpose()?;
        let maxima_price = model
            .soc_maxima_breach_price
            .as_ref()
            .map(|p| p.resolve(&field("soc-maxima-breach-price"), Dimension::EnergyPrice, None))
            .transpose()?;

        let stored_price = match &model.stored_energy_price {
            Some(p) => p.resolve(&field("stored-energy-price"), Dimension::EnergyPrice, None)?,
            None => prices.consumption.last().copied().unwrap_or_default(),
        };
        let mut soft = vec![self.stored_energy(&id, initial, stored_price)];
        let mut min_abs = vec![soc_min; len];
        let mut max_abs = vec![soc_max; len];
        match minima_price {
            Some(price) => soft.extend(self.soc_breaches(&id, "minima", &minima, price, false)),
            None => min_abs
                .iter_mut()
                .zip(&minima)
                .for_each(|(lo, m)| *lo = lo.max(m.unwrap_or(f64::NEG_INFINITY))),
        }
        match maxima_price {
            Some(price) => soft.extend(self.soc_breaches(&id, "maxima", &maxima, price, true)),
            None => max_abs
                .iter_mut()
                .zip(&maxima)
                .for_each(|(hi, m)| *hi = hi.min(m.unwrap_or(f64::INFINITY))),
        }

        let roundtrip = model
            .roundtrip_efficiency
            .as_ref()
            .map(|r| r.resolve(&field("roundtrip-efficiency"), Dimension::Ratio, None))
            .transpose()?;
        let one_way = roundtrip.map_or(1.0, f64::sqrt);
        let ratio = |spec: &Option<SeriesSpec>, key: &str, default: f64| match spec {
            Some(s) => s.values_or(grid, &field(key), Dimension::Ratio, default),
            None => Ok(vec![default; len]),
        };
        let power = |spec: &Option<SeriesSpec>, key: &str| match spec {
            Some(s) => s.values_or(grid, &field(key), Dimension::Power, 0.0),
            None => Ok(vec![0.0; len]),
        };
        let gain = power(&model.soc_gain, "soc-gain")?;
        let usage = power(&model.soc_usage, "soc-usage")?;

        let stock = StockModel {
            initial,
            min: min_abs.iter().map(|m| m - initial).collect(),
            max: max_abs.iter().map(|m| m - initial).collect(),
            equals: targets.iter().map(|t| t.map(|v| v - initial)).collect(),
            eta_up: ratio(&model.charging_efficiency, "charging-efficiency", one_way)?,
            eta_down: ratio(&model.discharging_efficiency, "discharging-efficiency", one_way)?,
            retention: ratio(&model.storage_efficiency, "storage-efficiency", 1.0)?
                .into_iter()
                .map(|per_hour| per_hour.powf(dt))
                .collect(),
            delta: gain.iter().zip(&usage).map(|(g, u)| (g - u) * dt).collect(),
            mode: model.efficiency_mode.unwrap_or_default(),
        };

        let (power_min, power_max) = self.power_band(name, model)?;
        let mut device = Device::flexible(id, power_min, power_max).with_stock(stock);
        device.prefer_charging_sooner = model
            .prefer_charging_sooner
            .unwrap_or(self.settings.prefer_charging_sooner);
        Ok((device, soft))
    }

    /// Credits energy left in storage at the end of the horizon, relative to
    /// the starting level, so the solver does not sell it off for nothing.
    fn stored_energy(&self, device: &DeviceId, initial: f64, price: f64) -> Commitment {
        let len = self.len();
        let mut quantity = vec![None; len];
        let mut up = vec![0.0; len];
        let mut down = vec![0.0; len];
        if let Some(last) = len.checked_sub(1) {
            quantity[last] = Some(initial);
            up[last] = -price;
            down[last] = price;
        }
        Commitment::stock(
            format!("{device}: stored energy"),
            device.clone(),
            quantity,
            up,
            down,
            Grouping::Each,
        )
    }

    fn power_band(
        &self,
        name: &str,
        model: &StorageFlexModel,
    ) -> Result<(Vec<f64>, Vec<f64>), ValidationError> {
        let field = |key: &str| format!("{name}.{key}");
        let series = |spec: &Option<SeriesSpec>, key: &str| {
            spec.as_ref()
                .map(|s| s.required(self.grid, &field(key), Dimension::Power))
                .transpose()
        };
        let power = series(&model.power_capacity, "power-capacity")?;
        let consumption = series(&model.consumption_capacity, "consumption-capacity")?;
        let production = series(&model.production_capacity, "production-capacity")?;
        if power.is_none() && consumption.is_none() && production.is_none() {
            return Err(ValidationError::device(
                name,
                "give power-capacity, consumption-capacity or production-capacity",
            ));
        }

        let zeros = vec![0.0; self.len()];
        let max = consumption.or_else(|| power.clone()).unwrap_or_else(|| zeros.clone());
        let min: Vec<f64> = production
            .or(power)
            .unwrap_or(zeros)
            .into_iter()
            .map(|p| -p)
            .collect();

        let restricted = restricted_slots(&model.time_restrictions, self.grid)?;
        let (min, max): (Vec<f64>, Vec<f64>) = min
            .into_iter()
            .zip(max)
            .zip(restricted)
            .map(|((lo, hi), blocked)| if blocked { (0.0, 0.0) } else { (lo, hi) })
            .unzip();
        Ok((min, max))
    }

    /// Soft SOC bounds: `any` prices the worst breach once, `all` prices each
    /// slot's breach.
    fn soc_breaches(
        &self,
        device: &DeviceId,
        kind: &str,
        levels: &[Option<f64>],
        price: f64,
        upwards: bool,
    ) -> Vec<Commitment> {
        if levels.iter().all(Option::is_none) {
            return Vec::new();
        }
        let len = self.len();
        let priced = |p: f64| {
            if upwards {
                (vec![p; len], vec![0.0; len])
            } else {
                (vec![0.0; len], vec![p; len])
            }
        };
        let (any_up, any_down) = priced(price);
        let (all_up, all_down) = priced(price * self.dt());
        vec![
            Commitment::stock(
                format!("{device}: any soc {kind}"),
                device.clone(),
                levels.to_vec(),
                any_up,
                any_down,
                Grouping::Any,
            ),
            Commitment::stock(
                format!("{device}: all soc {kind}"),
                device.clone(),
                levels.to_vec(),
                all_up,
                all_down,
                Grouping::Each,
            ),
        ]
    }

    fn process_device(
        &self,
        name: &str,
        model: &ProcessFlexModel,
        prices: &[f64],
    ) -> Result<Device, SchedulerError> {
        let power = model
            .power
            .resolve(&format!("{name}.power"), Dimension::Power, None)?;
        let duration = parse_iso_duration(&model.duration)
            .map_err(|e| ValidationError::field(format!("{name}.duration"), e.to_string()))?;
        let step = self.grid.resolution().num_seconds();
        let slots = (duration.num_seconds().max(0) + step - 1) / step;
        let spec = ProcessSpec {
            name: name.to_string(),
            process_type: model.process_type,
            power_kw: power,
            slots: slots as usize,
            restricted: restricted_slots(&model.time_restrictions, self.grid)?,
            direction: model.optimization_direction,
        };
        let power = spec.place(prices)?;
        Ok(Device::inflexible(DeviceId::new(name), power))
    }

    fn raw_commitment(&self, raw: &RawCommitment) -> Result<Commitment, ValidationError> {
        let field = |key: &str| format!("commitments.{}.{key}", raw.name);
        let baseline = match raw.class {
            CommitmentKind::Flow => {
                raw.baseline
                    .flow_values(self.grid, &field("baseline"), Dimension::Power, None)?
            }
            CommitmentKind::Stock => {
                raw.baseline
                    .state_values(self.grid, &field("baseline"), Dimension::Energy, None)?
            }
        };
        let up = self.commitment_price(&raw.up_price, &field("up-price"), raw.class)?;
        let down = self.commitment_price(&raw.down_price, &field("down-price"), raw.class)?;

        Ok(Commitment {
            name: raw.name.clone(),
            kind: raw.class,
            device: raw.device.as_ref().map(DeviceId::new),
            quantity: baseline,
            upwards_deviation_price: up,
            downwards_deviation_price: down,
            grouping: raw.grouping,
        })
    }

    /// Objective coefficients for a caller-supplied price. Energy prices on
    /// flow commitments are converted to a per-kW-slot cost. A bare number is
    /// read per kWh, like a bare tariff.
    fn commitment_price(
        &self,
        spec: &SeriesSpec,
        field: &str,
        kind: CommitmentKind,
    ) -> Result<Vec<f64>, ValidationError> {
        let dimension = spec.dimension()?;
        let values = spec.values_or(self.grid, field, dimension, 0.0)?;
        let per_kwh = matches!(dimension, Dimension::EnergyPrice | Dimension::Dimensionless);
        if per_kwh && kind == CommitmentKind::Flow {
            Ok(self.scaled(&values, 1.0))
        } else {
            Ok(values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request(json: &str) -> ScheduleRequest {
        serde_json::from_str(json).unwrap()
    }

    fn battery_request(flex_context: &str) -> ScheduleRequest {
        request(&format!(
            r#"{{
                "start": "2025-01-01T00:00:00+00:00",
                "duration": "PT4H",
                "resolution": "PT30M",
                "devices": [{{
                    "name": "battery",
                    "flex-model": {{
                        "soc-at-start": "5 kWh",
                        "soc-max": "10 kWh",
                        "soc-min": "10%",
                        "power-capacity": "4 kW",
                        "roundtrip-efficiency": "81%",
                        "storage-efficiency": "99%"
                    }}
                }}],
                "flex-context": {flex_context}
            }}"#
        ))
    }

    #[test]
    fn test_energy_commitment_scales_prices_by_slot_length() {
        let req = battery_request(r#"{"consumption-price": "0.3 EUR/kWh", "production-price": 0.1}"#);
        let problem = translate(&req, &TranslatorSettings::default()).unwrap();
        assert_eq!(problem.grid.len(), 8);
        let energy = &problem.commitments[0];
        assert_eq!(energy.name, "energy");
        assert!((energy.upwards_deviation_price[0] - 0.15).abs() < 1e-12);
        assert!((energy.downwards_deviation_price[0] + 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_storage_defaults() {
        let req = battery_request(r#"{"consumption-price": 0.3}"#);
        let problem = translate(&req, &TranslatorSettings::default()).unwrap();
        let battery = &problem.devices[0];
        assert_eq!(battery.power_max, vec![4.0; 8]);
        assert_eq!(battery.power_min, vec![-4.0; 8]);
        assert!(battery.prefer_charging_sooner);

        let stock = battery.stock.as_ref().unwrap();
        assert_eq!(stock.initial, 5.0);
        assert!((stock.min[0] - (1.0 - 5.0)).abs() < 1e-12);
        assert!((stock.max[0] - 5.0).abs() < 1e-12);
        assert!((stock.eta_up[0] - 0.9).abs() < 1e-12);
        assert!((stock.retention[0] - 0.99_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_missing_consumption_price_is_rejected() {
        let req = battery_request("{}");
        let err = translate(&req, &TranslatorSettings::default()).unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        assert!(err.to_string().contains("consumption-price"));
    }

    #[test]
    fn test_currency_mismatch_is_rejected() {
        let req = battery_request(
            r#"{"consumption-price": "0.3 EUR/kWh", "production-price": "0.1 USD/kWh"}"#,
        );
        assert!(translate(&req, &TranslatorSettings::default()).is_err());
    }

    #[test]
    fn test_site_capacities_become_hard_bounds() {
        let req = battery_request(
            r#"{"consumption-price": 0.3, "site-power-capacity": "10 kW",
                "site-consumption-capacity": "3 kW"}"#,
        );
        let problem = translate(&req, &TranslatorSettings::default()).unwrap();
        assert_eq!(problem.ems.max, vec![3.0; 8]);
        assert_eq!(problem.ems.min, vec![-10.0; 8]);
    }

    #[test]
    fn test_breach_price_softens_the_capacity() {
        let req = battery_request(
            r#"{"consumption-price": 0.3, "site-power-capacity": "10 kW",
                "site-consumption-capacity": "3 kW",
                "site-consumption-breach-price": "100 EUR/kW"}"#,
        );
        let problem = translate(&req, &TranslatorSettings::default()).unwrap();
        assert_eq!(problem.ems.max, vec![10.0; 8]);
        let names: Vec<&str> = problem.commitments.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"any consumption breach"));
        let all = problem
            .commitments
            .iter()
            .find(|c| c.name == "all consumption breaches")
            .unwrap();
        assert_eq!(all.grouping, Grouping::Each);
        assert_eq!(all.upwards_deviation_price, vec![50.0; 8]);
    }

    #[test]
    fn test_peak_price_without_peak_defaults_to_zero_baseline() {
        let req = battery_request(r#"{"consumption-price": 0.3, "site-peak-consumption-price": 12}"#);
        let problem = translate(&req, &TranslatorSettings::default()).unwrap();
        let peak = problem
            .commitments
            .iter()
            .find(|c| c.name == "consumption peak")
            .unwrap();
        assert_eq!(peak.grouping, Grouping::Any);
        assert_eq!(peak.quantity, vec![Some(0.0); 8]);
    }

    #[test]
    fn test_soft_soc_minima() {
        let req = request(
            r#"{
                "start": "2025-01-01T00:00:00Z", "end": "2025-01-01T02:00:00Z", "resolution": "PT1H",
                "devices": [{"name": "ev", "flex-model": {
                    "soc-at-start": 2, "soc-max": 40, "power-capacity": "11 kW",
                    "soc-minima": [{"datetime": "2025-01-01T02:00:00Z", "value": "50%"}],
                    "soc-minima-breach-price": "1 EUR/kWh"
                }}],
                "flex-context": {"consumption-price": 0.3}
            }"#,
        );
        let problem = translate(&req, &TranslatorSettings::default()).unwrap();
        let any = problem
            .commitments
            .iter()
            .find(|c| c.name == "ev: any soc minima")
            .unwrap();
        assert_eq!(any.kind, CommitmentKind::Stock);
        assert_eq!(any.quantity, vec![None, Some(20.0)]);
        assert_eq!(any.downwards_deviation_price, vec![1.0; 2]);
        // Soft minima leave the hard bound at soc-min.
        let stock = problem.devices[0].stock.as_ref().unwrap();
        assert_eq!(stock.min[1], -2.0);
    }

    #[test]
    fn test_time_restrictions_idle_the_device() {
        let req = request(
            r#"{
                "start": "2025-01-01T00:00:00Z", "duration": "PT3H", "resolution": "PT1H",
                "devices": [{"name": "battery", "flex-model": {
                    "soc-at-start": 1, "soc-max": 4, "consumption-capacity": "2 kW",
                    "time-restrictions": [{"start": "2025-01-01T01:00:00Z", "duration": "PT1H"}]
                }}],
                "flex-context": {"consumption-price": 0.3}
            }"#,
        );
        let problem = translate(&req, &TranslatorSettings::default()).unwrap();
        assert_eq!(problem.devices[0].power_max, vec![2.0, 0.0, 2.0]);
        assert_eq!(problem.devices[0].power_min, vec![0.0; 3]);
    }

    #[test]
    fn test_process_and_inflexible_devices() {
        let req = request(
            r#"{
                "start": "2025-01-01T00:00:00Z", "duration": "PT4H", "resolution": "PT1H",
                "devices": [{"name": "dryer", "flex-model": {
                    "process-type": "SHIFTABLE", "power": "2 kW", "duration": "PT90M"
                }}],
                "flex-context": {
                    "consumption-price": [
                        {"start": "2025-01-01T00:00:00Z", "duration": "PT2H", "value": 0.4},
                        {"start": "2025-01-01T02:00:00Z", "duration": "PT2H", "value": 0.1}
                    ],
                    "inflexible-device-sensors": [{"name": "pv", "power": "-1 kW"}]
                }
            }"#,
        );
        let problem = translate(&req, &TranslatorSettings::default()).unwrap();
        assert_eq!(problem.devices[0].power_max, vec![0.0, 0.0, 2.0, 2.0]);
        assert_eq!(problem.devices[1].power_min, vec![-1.0; 4]);
    }

    #[test]
    fn test_raw_commitment_prices() {
        let req = battery_request(
            r#"{"consumption-price": 0.3, "commitments": [
                {"name": "day-ahead", "baseline": "1 kW", "up-price": "0.2 EUR/kWh", "down-price": 0.05},
                {"name": "soc plan", "baseline": 6, "down-price": "1 EUR/kWh", "class": "stock", "device": "battery"}
            ]}"#,
        );
        let problem = translate(&req, &TranslatorSettings::default()).unwrap();
        let day_ahead = problem.commitments.iter().find(|c| c.name == "day-ahead").unwrap();
        assert!((day_ahead.upwards_deviation_price[0] - 0.1).abs() < 1e-12);
        assert!((day_ahead.downwards_deviation_price[0] - 0.025).abs() < 1e-12);
        let plan = problem.commitments.iter().find(|c| c.name == "soc plan").unwrap();
        assert_eq!(plan.downwards_deviation_price[0], 1.0);
        assert_eq!(plan.device, Some(DeviceId::new("battery")));
    }

    #[rstest]
    #[case(None, 0.2)]
    #[case(Some("\"0.12 EUR/kWh\""), 0.12)]
    fn test_stored_energy_is_credited_at_the_horizon_end(
        #[case] override_price: Option<&str>,
        #[case] expected: f64,
    ) {
        let extra = override_price
            .map(|p| format!(r#", "stored-energy-price": {p}"#))
            .unwrap_or_default();
        let req = request(&format!(
            r#"{{
                "start": "2025-01-01T00:00:00Z", "duration": "PT3H", "resolution": "PT1H",
                "devices": [{{"name": "battery", "flex-model": {{
                    "soc-at-start": "3 kWh", "soc-max": "10 kWh", "power-capacity": "2 kW"{extra}
                }}}}],
                "flex-context": {{"consumption-price": [
                    {{"start": "2025-01-01T00:00:00Z", "duration": "PT2H", "value": 0.4}},
                    {{"start": "2025-01-01T02:00:00Z", "duration": "PT1H", "value": 0.2}}
                ]}}
            }}"#
        ));
        let problem = translate(&req, &TranslatorSettings::default()).unwrap();
        let stored = problem
            .commitments
            .iter()
            .find(|c| c.name == "battery: stored energy")
            .unwrap();
        assert_eq!(stored.kind, CommitmentKind::Stock);
        assert_eq!(stored.grouping, Grouping::Each);
        assert_eq!(stored.quantity, vec![None, None, Some(3.0)]);
        assert!((stored.upwards_deviation_price[2] + expected).abs() < 1e-12);
        assert!((stored.downwards_deviation_price[2] - expected).abs() < 1e-12);
        assert_eq!(stored.upwards_deviation_price[..2], [0.0, 0.0]);
    }

    #[test]
    fn test_horizon_needs_end_or_duration() {
        let req = request(
            r#"{"start": "2025-01-01T00:00:00Z", "resolution": "PT1H", "devices": []}"#,
        );
        assert!(req.grid().is_err());
    }
}
