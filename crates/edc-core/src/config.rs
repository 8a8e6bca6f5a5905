//! Configuration schema for the edge data center
//!
//! Every level validates itself so that configuration errors fail fast at
//! construction time, before any simulated time elapses.

use crate::types::RackId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// DVFS index used when DVFS is disabled (full speed)
pub const FULL_SPEED_DVFS_INDEX: u32 = 100;

/// Operating point of a DVFS table entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DvfsPoint {
    /// Clock frequency relative to full speed, in (0, 1]
    pub frequency: f64,
}

/// DVFS operating points keyed by the relative utilization (percent) they cover
pub type DvfsTable = BTreeMap<u32, DvfsPoint>;

fn default_dvfs_table() -> DvfsTable {
    let mut table = DvfsTable::new();
    table.insert(FULL_SPEED_DVFS_INDEX, DvfsPoint { frequency: 1.0 });
    table
}

fn default_ambient_temperature() -> f64 {
    25.0
}

/// Power model selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PowerModelConfig {
    #[serde(rename = "constant")]
    Constant { power: f64 },
    #[serde(rename = "linear")]
    Linear { idle_power: f64, max_power: f64 },
    #[serde(rename = "dvfs")]
    Dvfs {
        static_power: f64,
        max_power: f64,
        util_coef: f64,
        freq_coef: f64,
    },
    #[serde(rename = "asymptotic")]
    Asymptotic { min_power: f64, max_power: f64, tau: f64 },
}

impl PowerModelConfig {
    pub fn validate(&self) -> Result<()> {
        let non_negative = |name: &str, value: f64| {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(Error::config(format!("Power model {} must be non-negative, got {}", name, value)))
            }
        };

        match self {
            PowerModelConfig::Constant { power } => non_negative("power", *power),
            PowerModelConfig::Linear { idle_power, max_power } => {
                non_negative("idle_power", *idle_power)?;
                non_negative("max_power", *max_power)?;
                if max_power < idle_power {
                    return Err(Error::config("Linear power model max_power is below idle_power"));
                }
                Ok(())
            }
            PowerModelConfig::Dvfs { static_power, max_power, util_coef, freq_coef } => {
                non_negative("static_power", *static_power)?;
                non_negative("max_power", *max_power)?;
                non_negative("util_coef", *util_coef)?;
                non_negative("freq_coef", *freq_coef)
            }
            PowerModelConfig::Asymptotic { min_power, max_power, tau } => {
                non_negative("min_power", *min_power)?;
                non_negative("max_power", *max_power)?;
                if !(*tau > 0.0) {
                    return Err(Error::config(format!("Asymptotic power model tau must be positive, got {}", tau)));
                }
                Ok(())
            }
        }
    }
}

/// Temperature model selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TemperatureModelConfig {
    /// Steady-state temperature: ambient + thermal_resistance * power
    #[serde(rename = "linear")]
    Linear { thermal_resistance: f64 },
}

impl TemperatureModelConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            TemperatureModelConfig::Linear { thermal_resistance } => {
                if !thermal_resistance.is_finite() || *thermal_resistance < 0.0 {
                    return Err(Error::config(format!(
                        "Thermal resistance must be non-negative, got {}",
                        thermal_resistance
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Processing unit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuConfig {
    /// Free-form hardware type label
    pub pu_type: String,
    /// Maximum capacity
    pub max_u: f64,
    /// Maximum number of sessions starting or stopping at once (<= 0 means unlimited)
    #[serde(default)]
    pub max_start_stop: i32,
    /// Time to power on
    pub t_on: f64,
    /// Time to power off
    pub t_off: f64,
    /// Time to start a session
    pub t_start: f64,
    /// Time to stop a session
    pub t_stop: f64,
    /// Time to answer an ongoing session check
    pub t_operation: f64,
    #[serde(default = "default_dvfs_table")]
    pub dvfs_table: DvfsTable,
    #[serde(default)]
    pub power_model: Option<PowerModelConfig>,
    #[serde(default)]
    pub temperature_model: Option<TemperatureModelConfig>,
    #[serde(default = "default_ambient_temperature")]
    pub ambient_temperature: f64,
}

impl PuConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_u > 0.0) || !self.max_u.is_finite() {
            return Err(Error::config(format!("max_u must be positive, got {}", self.max_u)));
        }

        for (name, value) in [
            ("t_on", self.t_on),
            ("t_off", self.t_off),
            ("t_start", self.t_start),
            ("t_stop", self.t_stop),
            ("t_operation", self.t_operation),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::config(format!("{} must be non-negative, got {}", name, value)));
            }
        }

        if !self.dvfs_table.contains_key(&FULL_SPEED_DVFS_INDEX) {
            return Err(Error::config(format!(
                "DVFS table of PU type '{}' lacks the {} entry",
                self.pu_type, FULL_SPEED_DVFS_INDEX
            )));
        }
        for (index, point) in &self.dvfs_table {
            if *index == 0 || *index > FULL_SPEED_DVFS_INDEX {
                return Err(Error::config(format!("DVFS table key {} out of range 1..=100", index)));
            }
            if !(point.frequency > 0.0) || point.frequency > 1.0 {
                return Err(Error::config(format!(
                    "DVFS frequency at {} must be in (0, 1], got {}",
                    index, point.frequency
                )));
            }
        }

        if let Some(model) = &self.power_model {
            model.validate()?;
        }
        if let Some(model) = &self.temperature_model {
            model.validate()?;
        }

        Ok(())
    }

    /// Whether the start/stop concurrency ceiling is disabled
    pub fn unlimited_start_stop(&self) -> bool {
        self.max_start_stop <= 0
    }
}

impl Default for PuConfig {
    fn default() -> Self {
        Self {
            pu_type: "generic".to_string(),
            max_u: 100.0,
            max_start_stop: 0,
            t_on: 1.0,
            t_off: 1.0,
            t_start: 0.5,
            t_stop: 0.5,
            t_operation: 0.1,
            dvfs_table: default_dvfs_table(),
            power_model: None,
            temperature_model: None,
            ambient_temperature: default_ambient_temperature(),
        }
    }
}

/// Built-in dispatching strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyType {
    /// Place on the PU with the most residual capacity
    #[serde(rename = "emptiest")]
    EmptiestPu,
    /// Place on the PU with the least non-negative residual capacity
    #[serde(rename = "fullest")]
    FullestPu,
}

impl std::str::FromStr for StrategyType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "emptiest" => Ok(StrategyType::EmptiestPu),
            "fullest" => Ok(StrategyType::FullestPu),
            _ => Err(format!("Unknown dispatching strategy: {}", s)),
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyType::EmptiestPu => write!(f, "emptiest"),
            StrategyType::FullestPu => write!(f, "fullest"),
        }
    }
}

/// Resource manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub strategy: StrategyType,
    /// Power off PUs that hold no session
    #[serde(default)]
    pub hw_power_off: bool,
    /// DVFS preference broadcast to every PU
    #[serde(default)]
    pub hw_dvfs_mode: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyType::EmptiestPu,
            hw_power_off: false,
            hw_dvfs_mode: false,
        }
    }
}

/// A rack: one resource manager in front of a vector of PUs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RackConfig {
    pub id: RackId,
    #[serde(default)]
    pub manager: ManagerConfig,
    pub pus: Vec<PuConfig>,
}

impl RackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pus.is_empty() {
            return Err(Error::config(format!("Rack {} must have at least 1 PU", self.id)));
        }
        for pu in &self.pus {
            pu.validate()?;
        }
        Ok(())
    }
}

/// The edge data center: a vector of racks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdcConfig {
    pub id: String,
    pub racks: Vec<RackConfig>,
}

impl EdcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.racks.is_empty() {
            return Err(Error::config(format!("EDC {} must have at least 1 rack", self.id)));
        }

        let mut seen = BTreeSet::new();
        for rack in &self.racks {
            if !seen.insert(rack.id.clone()) {
                return Err(Error::config(format!("Duplicate rack id: {}", rack.id)));
            }
            rack.validate()?;
        }
        Ok(())
    }

    /// Total number of PUs in the data center
    pub fn total_pus(&self) -> usize {
        self.racks.iter().map(|r| r.pus.len()).sum()
    }
}
