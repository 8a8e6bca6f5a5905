//! # Edge Data Center Simulator
//!
//! A discrete-event simulator of edge data centers hosting service sessions.
//! Racks are made of processing units (PUs) fronted by a resource manager that
//! admits, places, and tears down sessions, and that powers PUs on and off.
//!
//! ## Features
//!
//! - PU state machine with start/stop/operation delays and power-up/down phases
//! - Resource manager with a speculative per-PU mirror and blocking commands
//! - Pluggable dispatching strategies: emptiest and fullest PU
//! - DVFS-aware power and thermal models
//! - Synthetic session workloads and energy/admission metrics

pub mod dispatch;
pub mod edc;
pub mod engine;
pub mod manager;
pub mod metrics;
pub mod mux;
pub mod power;
pub mod pu;
pub mod rack;
pub mod workload;

pub use dispatch::{EmptiestPu, FullestPu, StrategyFactory};
pub use edc::{Edc, EdcInput, EdcOutput};
pub use engine::{Atomic, SimTime, Simulator, INFINITY};
pub use manager::{ManagerInput, ManagerOutput, ResourceManager};
pub use metrics::{Metrics, MetricsSummary};
pub use mux::Multiplexer;
pub use pu::{ProcessingUnit, PuAck, PuCommand, PuOutput, PuPhase};
pub use rack::{Rack, RackOutput};
pub use workload::{ScheduledRequest, WorkloadConfig, WorkloadGenerator};

use std::collections::BTreeMap;

use anyhow::Result;
use edc_core::{
    DvfsPoint, EdcConfig, ErrorContext, ManagerConfig, PowerModelConfig, PuConfig, RackConfig, RackId,
    StrategyType, TemperatureModelConfig,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Upper bound on engine steps in one run
const MAX_EVENTS: u64 = 10_000_000;

/// Complete simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Simulation duration in seconds
    pub duration_s: f64,
    /// Data center topology
    pub edc: EdcConfig,
    /// Session workload
    pub workload: WorkloadConfig,
    /// Dispatching strategies to compare
    pub strategies: Vec<StrategyType>,
}

impl SimulationConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: &str) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.edc.validate()?;
        self.workload.validate()?;

        if self.duration_s <= 0.0 {
            return Err(anyhow::anyhow!("Duration must be positive"));
        }
        if self.strategies.is_empty() {
            return Err(anyhow::anyhow!("Must specify at least one dispatching strategy"));
        }

        Ok(())
    }

    fn rack_ids(&self) -> Vec<RackId> {
        self.edc.racks.iter().map(|rack| rack.id.clone()).collect()
    }
}

/// Small data center with two services, used by `edc-sim generate`
pub fn example_config() -> SimulationConfig {
    use crate::workload::{ArrivalConfig, CostDistribution, DurationDistribution, ServiceConfig};

    let mut pu = PuConfig {
        pu_type: "edge-gpu".to_string(),
        power_model: Some(PowerModelConfig::Dvfs {
            static_power: 50.0,
            max_power: 250.0,
            util_coef: 0.3,
            freq_coef: 0.7,
        }),
        temperature_model: Some(TemperatureModelConfig::Linear { thermal_resistance: 0.2 }),
        ..PuConfig::default()
    };
    pu.dvfs_table.insert(50, DvfsPoint { frequency: 0.6 });

    let rack = |id: &str| RackConfig {
        id: RackId::new(id),
        manager: ManagerConfig {
            strategy: StrategyType::EmptiestPu,
            hw_power_off: true,
            hw_dvfs_mode: true,
        },
        pus: vec![pu.clone(); 4],
    };

    SimulationConfig {
        seed: 42,
        duration_s: 600.0,
        edc: EdcConfig {
            id: "edc-0".to_string(),
            racks: vec![rack("rack-0"), rack("rack-1")],
        },
        workload: WorkloadConfig {
            services: vec![
                ServiceConfig {
                    service_id: "video".to_string(),
                    arrival: ArrivalConfig::Poisson { rate: 0.5 },
                    cost: CostDistribution::Uniform { min: 10.0, max: 40.0 },
                    duration: DurationDistribution::Exponential { mean_s: 30.0 },
                    keepalive_s: Some(5.0),
                },
                ServiceConfig {
                    service_id: "telemetry".to_string(),
                    arrival: ArrivalConfig::Periodic { period_s: 4.0 },
                    cost: CostDistribution::Constant { value: 5.0 },
                    duration: DurationDistribution::Uniform { min_s: 10.0, max_s: 60.0 },
                    keepalive_s: None,
                },
            ],
        },
        strategies: vec![StrategyType::EmptiestPu, StrategyType::FullestPu],
    }
}

/// Main simulation runner
pub struct SimulationRunner {
    config: SimulationConfig,
    requests: Vec<ScheduledRequest>,
}

impl SimulationRunner {
    /// Create a new simulation runner; the workload is drawn once and shared
    /// by every strategy.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;

        let mut generator =
            WorkloadGenerator::new(config.workload.clone(), config.rack_ids(), config.seed)
                .with_context("Failed to create workload generator")?;
        let requests = generator.generate(config.duration_s)?;
        tracing::info!(
            "Generated {} session requests over {:.1}s",
            requests.len(),
            config.duration_s
        );

        Ok(Self { config, requests })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn requests(&self) -> &[ScheduledRequest] {
        &self.requests
    }

    /// Run the simulation with all configured strategies, one independent run each
    pub fn run_all_strategies(&self) -> Result<BTreeMap<String, MetricsSummary>> {
        tracing::info!("Running {} strategies in parallel", self.config.strategies.len());

        self.config
            .strategies
            .par_iter()
            .map(|strategy| -> Result<(String, MetricsSummary)> {
                let summary = self.run_single_strategy(*strategy)?;
                Ok((strategy.to_string(), summary))
            })
            .collect::<Result<Vec<_>>>()
            .map(|results| results.into_iter().collect())
    }

    /// Run the simulation with a single strategy
    pub fn run_single_strategy(&self, strategy: StrategyType) -> Result<MetricsSummary> {
        let edc = Edc::with_strategy(&self.config.edc, strategy)
            .with_context(format!("Failed to assemble {} for strategy {}", self.config.edc.id, strategy))?;
        let duration = self.config.duration_s;
        let progress_interval = duration / 10.0;

        tracing::info!(
            "Starting simulation [{}]: {} racks, {} PUs, {:.1}s duration",
            strategy,
            self.config.edc.racks.len(),
            self.config.edc.total_pus(),
            duration
        );

        let mut sim = Simulator::new(edc);
        let mut metrics = Metrics::new()?;
        sim.initialize(0.0);

        let mut pending = self.requests.iter().peekable();
        let mut events_processed = 0u64;
        let mut last_progress = 0.0;

        loop {
            let next_internal = sim.next_time();
            let next_request = pending.peek().map_or(INFINITY, |r| r.time);
            let t = next_internal.min(next_request);
            if t > duration || t == INFINITY {
                break;
            }

            for output in sim.collect(t) {
                metrics.record_output(t, &output);
            }

            let mut bag = Vec::new();
            while let Some(request) = pending.next_if(|r| r.time == t) {
                metrics.record_request(t, &request.input.request);
                bag.push(request.input.clone());
            }

            sim.transition(t, bag)?;
            events_processed += 1;

            if t - last_progress >= progress_interval {
                tracing::info!(
                    "Simulation progress [{}]: {:.1}s/{:.1}s ({:.1}%), {} events processed",
                    strategy,
                    t,
                    duration,
                    (t / duration) * 100.0,
                    events_processed
                );
                last_progress = t;
            }

            if events_processed >= MAX_EVENTS {
                tracing::warn!("Event limit reached (10M events), terminating simulation");
                break;
            }
        }

        sim.finalize();
        let summary = metrics.generate_summary(&strategy.to_string(), duration);
        tracing::info!(
            "Finished simulation [{}]: {} accepted, {} rejected, {:.1} J",
            strategy,
            summary.counters.accepted,
            summary.counters.rejected,
            summary.energy_j
        );
        Ok(summary)
    }
}

/// Strategy comparison
pub mod analysis {
    use super::*;

    /// Compare multiple simulation results
    pub fn compare_strategies(results: &BTreeMap<String, MetricsSummary>) -> StrategyComparison {
        let mut comparison = StrategyComparison::default();

        for (strategy, summary) in results {
            comparison.energy_j.insert(strategy.clone(), summary.energy_j);
            comparison.peak_power_w.insert(strategy.clone(), summary.peak_power_w);
            comparison
                .acceptance_rate
                .insert(strategy.clone(), summary.acceptance_rate);
            if let Some(latency) = &summary.admission_latency_ms {
                comparison.admission_p95_ms.insert(strategy.clone(), latency.p95);
            }
        }

        comparison
    }

    /// Strategy comparison results
    #[derive(Debug, Default, Serialize, Deserialize)]
    pub struct StrategyComparison {
        pub energy_j: BTreeMap<String, f64>,
        pub peak_power_w: BTreeMap<String, f64>,
        pub acceptance_rate: BTreeMap<String, f64>,
        pub admission_p95_ms: BTreeMap<String, f64>,
    }

    impl StrategyComparison {
        /// Find the best strategy for a given metric
        pub fn best_strategy_for_metric(&self, metric: &str) -> Option<String> {
            let values = match metric {
                "energy_j" => &self.energy_j,
                "peak_power_w" => &self.peak_power_w,
                "acceptance_rate" => &self.acceptance_rate,
                "admission_p95_ms" => &self.admission_p95_ms,
                _ => return None,
            };

            // Only acceptance improves upwards
            let best = if metric == "acceptance_rate" {
                values.iter().max_by(|a, b| a.1.total_cmp(b.1))
            } else {
                values.iter().min_by(|a, b| a.1.total_cmp(b.1))
            };
            best.map(|(strategy, _)| strategy.clone())
        }

        /// Export comparison to CSV
        pub fn to_csv(&self) -> String {
            let mut csv = String::new();
            csv.push_str("strategy,energy_j,peak_power_w,acceptance_rate,admission_p95_ms\n");

            let strategies: std::collections::BTreeSet<_> = self
                .energy_j
                .keys()
                .chain(self.peak_power_w.keys())
                .chain(self.acceptance_rate.keys())
                .chain(self.admission_p95_ms.keys())
                .collect();

            for strategy in strategies {
                csv.push_str(&format!(
                    "{},{},{},{},{}\n",
                    strategy,
                    self.energy_j.get(strategy).unwrap_or(&0.0),
                    self.peak_power_w.get(strategy).unwrap_or(&0.0),
                    self.acceptance_rate.get(strategy).unwrap_or(&0.0),
                    self.admission_p95_ms.get(strategy).unwrap_or(&0.0),
                ));
            }

            csv
        }
    }
}
