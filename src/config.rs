use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::flex::TranslatorSettings;
use crate::optimizer::{BiasCurve, SolveSettings, SolverKind, TieBreak};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub solver: SolverConfig,
    #[validate(nested)]
    pub scheduler: SchedulerConfig,
    #[validate(nested)]
    pub retry: RetryConfig,
    #[validate(nested)]
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SolverConfig {
    pub backend: SolverKind,
    #[validate(range(min = 1, max = 86_400))]
    pub time_limit_seconds: u64,
    #[validate(range(max = 60_000))]
    pub grace_millis: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            backend: SolverKind::default(),
            time_limit_seconds: 30,
            grace_millis: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SchedulerConfig {
    pub prefer_charging_sooner: bool,
    #[validate(range(min = 0.0, max = 0.5))]
    pub tie_break_relative: f64,
    pub tie_break_curve: BiasCurve,
    #[validate(range(min = 0.0, max = 10.0))]
    pub big_m_margin: f64,
    #[validate(range(min = 1e-12, max = 1e-2))]
    pub tolerance: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prefer_charging_sooner: true,
            tie_break_relative: 1e-3,
            tie_break_curve: BiasCurve::Linear,
            big_m_margin: 0.1,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RetryConfig {
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,
    /// Factor applied to the solver budget after each failed attempt.
    #[validate(range(min = 1.0, max = 10.0))]
    pub budget_growth: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            budget_growth: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ServiceConfig {
    #[validate(range(min = 1, max = 256))]
    pub max_concurrent_jobs: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: true,
        }
    }
}

impl Config {
    /// Defaults, then `config/default.toml`, then `OES__`-prefixed variables
    /// (`OES__SOLVER__BACKEND=highs`).
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("config/default.toml"))
                .merge(Env::prefixed("OES__").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract().context("reading configuration")?;
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }

    pub fn solve_settings(&self) -> SolveSettings {
        SolveSettings {
            budget: Duration::from_secs(self.solver.time_limit_seconds),
            grace: Duration::from_millis(self.solver.grace_millis),
            tolerance: self.scheduler.tolerance,
            big_m_margin: self.scheduler.big_m_margin,
            tie_break: TieBreak {
                enabled: self.scheduler.tie_break_relative > 0.0,
                relative: self.scheduler.tie_break_relative,
                curve: self.scheduler.tie_break_curve,
            },
        }
    }

    pub fn translator_settings(&self) -> TranslatorSettings {
        TranslatorSettings {
            prefer_charging_sooner: self.scheduler.prefer_charging_sooner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::from_figment(Figment::from(Serialized::defaults(Config::default())))
            .unwrap();
        assert_eq!(cfg.solver.backend, SolverKind::Microlp);
        assert_eq!(cfg.solve_settings().budget, Duration::from_secs(30));
        assert!(cfg.translator_settings().prefer_charging_sooner);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let toml = r#"
            [solver]
            time_limit_seconds = 5

            [scheduler]
            tie_break_curve = "quadratic"
        "#;
        let cfg = Config::from_figment(
            Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml)),
        )
        .unwrap();
        assert_eq!(cfg.solver.time_limit_seconds, 5);
        assert_eq!(cfg.solver.grace_millis, 2_000);
        assert_eq!(cfg.solve_settings().tie_break.curve, BiasCurve::Quadratic);
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let toml = "[retry]\nmax_attempts = 0\n";
        let result = Config::from_figment(
            Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_relative_disables_tie_break() {
        let mut cfg = Config::default();
        cfg.scheduler.tie_break_relative = 0.0;
        assert!(!cfg.solve_settings().tie_break.enabled);
    }
}
