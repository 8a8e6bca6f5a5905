//! Power and temperature models for processing units.
//!
//! Every built-in power model draws nothing while the PU is off.

use std::f64::consts::E;

use edc_core::{PowerContext, PowerModel, PowerModelConfig, TemperatureModel, TemperatureModelConfig};

/// Fixed power draw while on
#[derive(Debug, Clone)]
pub struct ConstantPowerModel {
    power: f64,
}

impl ConstantPowerModel {
    pub fn new(power: f64) -> Self {
        Self { power }
    }
}

impl PowerModel for ConstantPowerModel {
    fn power(&self, ctx: &PowerContext<'_>) -> f64 {
        if ctx.status {
            self.power
        } else {
            0.0
        }
    }
}

/// Power grows linearly from `idle_power` to `max_power` with the load
#[derive(Debug, Clone)]
pub struct LinearPowerModel {
    idle_power: f64,
    max_power: f64,
}

impl LinearPowerModel {
    pub fn new(idle_power: f64, max_power: f64) -> Self {
        Self { idle_power, max_power }
    }
}

impl PowerModel for LinearPowerModel {
    fn power(&self, ctx: &PowerContext<'_>) -> f64 {
        if !ctx.status {
            return 0.0;
        }
        self.idle_power + (self.max_power - self.idle_power) * ctx.load()
    }
}

/// DVFS-aware model: the clock frequency of the selected operating point
/// scales the dynamic part of the power draw.
///
/// `P = P_static + (util_coef + freq_coef * f) * u * P_max`
#[derive(Debug, Clone)]
pub struct DvfsPowerModel {
    static_power: f64,
    max_power: f64,
    util_coef: f64,
    freq_coef: f64,
}

impl DvfsPowerModel {
    pub fn new(static_power: f64, max_power: f64, util_coef: f64, freq_coef: f64) -> Self {
        Self {
            static_power,
            max_power,
            util_coef,
            freq_coef,
        }
    }
}

impl PowerModel for DvfsPowerModel {
    fn power(&self, ctx: &PowerContext<'_>) -> f64 {
        if !ctx.status {
            return 0.0;
        }
        self.static_power
            + (self.util_coef + self.freq_coef * ctx.frequency()) * ctx.load() * self.max_power
    }
}

/// Non-linear model: `P(u) = P_min + 1/2 (P_max - P_min) (1 + u - e^(-u / tau))`
#[derive(Debug, Clone)]
pub struct AsymptoticPowerModel {
    min_power: f64,
    tau: f64,
    factor: f64,
}

impl AsymptoticPowerModel {
    pub fn new(min_power: f64, max_power: f64, tau: f64) -> Self {
        Self {
            min_power,
            tau,
            factor: max_power - min_power,
        }
    }
}

impl PowerModel for AsymptoticPowerModel {
    fn power(&self, ctx: &PowerContext<'_>) -> f64 {
        if !ctx.status {
            return 0.0;
        }
        let u = ctx.load();
        self.min_power + self.factor * (1.0 + u - E.powf(-u / self.tau)) / 2.0
    }
}

/// Steady-state temperature proportional to the power draw
#[derive(Debug, Clone)]
pub struct LinearTemperatureModel {
    thermal_resistance: f64,
}

impl LinearTemperatureModel {
    pub fn new(thermal_resistance: f64) -> Self {
        Self { thermal_resistance }
    }
}

impl TemperatureModel for LinearTemperatureModel {
    fn temperature(&self, _ctx: &PowerContext<'_>, power: f64, ambient: f64) -> f64 {
        ambient + self.thermal_resistance * power
    }
}

/// Build the power model described by a configuration entry
pub fn build_power_model(config: &PowerModelConfig) -> Box<dyn PowerModel> {
    match config {
        PowerModelConfig::Constant { power } => Box::new(ConstantPowerModel::new(*power)),
        PowerModelConfig::Linear { idle_power, max_power } => {
            Box::new(LinearPowerModel::new(*idle_power, *max_power))
        }
        PowerModelConfig::Dvfs { static_power, max_power, util_coef, freq_coef } => Box::new(
            DvfsPowerModel::new(*static_power, *max_power, *util_coef, *freq_coef),
        ),
        PowerModelConfig::Asymptotic { min_power, max_power, tau } => {
            Box::new(AsymptoticPowerModel::new(*min_power, *max_power, *tau))
        }
    }
}

/// Build the temperature model described by a configuration entry
pub fn build_temperature_model(config: &TemperatureModelConfig) -> Box<dyn TemperatureModel> {
    match config {
        TemperatureModelConfig::Linear { thermal_resistance } => {
            Box::new(LinearTemperatureModel::new(*thermal_resistance))
        }
    }
}
