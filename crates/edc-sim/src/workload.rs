use rand::prelude::*;
use rand::rngs::SmallRng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

use edc_core::{Error, RackId, RequestId, Result, SessionRequest};

use crate::edc::EdcInput;
use crate::engine::SimTime;

/// Synthetic session workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub services: Vec<ServiceConfig>,
}

/// One service issuing sessions independently of the others
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub service_id: String,
    pub arrival: ArrivalConfig,
    /// Utilization cost of one session
    pub cost: CostDistribution,
    /// Session lifetime in seconds
    pub duration: DurationDistribution,
    /// Period of liveness checks on open sessions, if any
    #[serde(default)]
    pub keepalive_s: Option<f64>,
}

/// Session arrival process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ArrivalConfig {
    #[serde(rename = "poisson")]
    Poisson { rate: f64 },
    #[serde(rename = "periodic")]
    Periodic { period_s: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "dist")]
pub enum CostDistribution {
    #[serde(rename = "constant")]
    Constant { value: f64 },
    #[serde(rename = "uniform")]
    Uniform { min: f64, max: f64 },
}

impl CostDistribution {
    pub fn sample(&self, rng: &mut SmallRng) -> f64 {
        match self {
            CostDistribution::Constant { value } => *value,
            CostDistribution::Uniform { min, max } => rng.gen_range(*min..=*max),
        }
    }

    fn validate(&self) -> Result<()> {
        let valid = match self {
            CostDistribution::Constant { value } => *value > 0.0,
            CostDistribution::Uniform { min, max } => *min > 0.0 && min <= max,
        };
        if valid {
            Ok(())
        } else {
            Err(Error::config(format!("Invalid session cost distribution: {:?}", self)))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "dist")]
pub enum DurationDistribution {
    #[serde(rename = "exponential")]
    Exponential { mean_s: f64 },
    #[serde(rename = "uniform")]
    Uniform { min_s: f64, max_s: f64 },
    #[serde(rename = "constant")]
    Constant { value_s: f64 },
}

impl DurationDistribution {
    pub fn sample(&self, rng: &mut SmallRng) -> Result<f64> {
        match self {
            DurationDistribution::Exponential { mean_s } => {
                let exp = Exp::new(1.0 / mean_s)
                    .map_err(|e| Error::config(format!("Invalid session duration: {}", e)))?;
                Ok(exp.sample(rng))
            }
            DurationDistribution::Uniform { min_s, max_s } => Ok(rng.gen_range(*min_s..=*max_s)),
            DurationDistribution::Constant { value_s } => Ok(*value_s),
        }
    }

    fn validate(&self) -> Result<()> {
        let valid = match self {
            DurationDistribution::Exponential { mean_s } => *mean_s > 0.0,
            DurationDistribution::Uniform { min_s, max_s } => *min_s > 0.0 && min_s <= max_s,
            DurationDistribution::Constant { value_s } => *value_s > 0.0,
        };
        if valid {
            Ok(())
        } else {
            Err(Error::config(format!("Invalid session duration distribution: {:?}", self)))
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(Error::config("Workload must contain at least one service"));
        }
        for service in &self.services {
            if service.service_id.is_empty() {
                return Err(Error::config("Service id must not be empty"));
            }
            match service.arrival {
                ArrivalConfig::Poisson { rate } if rate <= 0.0 => {
                    return Err(Error::config(format!(
                        "Service {}: arrival rate must be positive",
                        service.service_id
                    )));
                }
                ArrivalConfig::Periodic { period_s } if period_s <= 0.0 => {
                    return Err(Error::config(format!(
                        "Service {}: arrival period must be positive",
                        service.service_id
                    )));
                }
                _ => {}
            }
            if matches!(service.keepalive_s, Some(period) if period <= 0.0) {
                return Err(Error::config(format!(
                    "Service {}: keep-alive period must be positive",
                    service.service_id
                )));
            }
            service.cost.validate()?;
            service.duration.validate()?;
        }
        Ok(())
    }
}

/// A request due at a given simulated time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledRequest {
    pub time: SimTime,
    pub input: EdcInput,
}

/// Workload generator
pub struct WorkloadGenerator {
    config: WorkloadConfig,
    racks: Vec<RackId>,
    rng: SmallRng,
    next_rack: usize,
    next_request_id: RequestId,
}

impl WorkloadGenerator {
    /// Create a generator addressing sessions to `racks` round-robin
    pub fn new(config: WorkloadConfig, racks: Vec<RackId>, seed: u64) -> Result<Self> {
        config.validate()?;
        if racks.is_empty() {
            return Err(Error::config("Workload needs at least one rack"));
        }

        Ok(Self {
            config,
            racks,
            rng: SmallRng::seed_from_u64(seed),
            next_rack: 0,
            next_request_id: 1,
        })
    }

    fn next_arrival(&mut self, arrival: &ArrivalConfig, now: SimTime) -> Result<SimTime> {
        match arrival {
            ArrivalConfig::Poisson { rate } => {
                let exp = Exp::new(*rate)
                    .map_err(|e| Error::config(format!("Invalid arrival rate: {}", e)))?;
                Ok(now + exp.sample(&mut self.rng))
            }
            ArrivalConfig::Periodic { period_s } => Ok(now + period_s),
        }
    }

    fn pick_rack(&mut self) -> RackId {
        let rack = self.racks[self.next_rack % self.racks.len()].clone();
        self.next_rack += 1;
        rack
    }

    /// Every request issued before `horizon`, ordered by time.
    ///
    /// Sessions still open at the horizon are left open.
    pub fn generate(&mut self, horizon: SimTime) -> Result<Vec<ScheduledRequest>> {
        let services = self.config.services.clone();
        let mut requests = Vec::new();

        for service in &services {
            let mut now = 0.0;
            let mut sequence = 0u64;
            loop {
                now = self.next_arrival(&service.arrival, now)?;
                if now >= horizon {
                    break;
                }
                sequence += 1;

                let session_id = format!("{}-{}", service.service_id, sequence);
                let rack_id = self.pick_rack();
                let cost = service.cost.sample(&mut self.rng);
                let end = now + service.duration.sample(&mut self.rng)?;

                requests.push(ScheduledRequest {
                    time: now,
                    input: EdcInput::new(
                        rack_id.clone(),
                        SessionRequest::create(&service.service_id, &session_id, cost),
                    ),
                });

                if let Some(period) = service.keepalive_s {
                    let mut check = now + period;
                    while check < end && check < horizon {
                        let request_id = self.next_request_id;
                        self.next_request_id += 1;
                        requests.push(ScheduledRequest {
                            time: check,
                            input: EdcInput::new(
                                rack_id.clone(),
                                SessionRequest::ongoing(&service.service_id, &session_id, request_id),
                            ),
                        });
                        check += period;
                    }
                }

                if end < horizon {
                    requests.push(ScheduledRequest {
                        time: end,
                        input: EdcInput::new(
                            rack_id,
                            SessionRequest::remove(&service.service_id, &session_id),
                        ),
                    });
                }
            }
        }

        // Stable: same-instant requests keep service order
        requests.sort_by(|a, b| a.time.total_cmp(&b.time));
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> WorkloadConfig {
        WorkloadConfig {
            services: vec![
                ServiceConfig {
                    service_id: "video".to_string(),
                    arrival: ArrivalConfig::Poisson { rate: 2.0 },
                    cost: CostDistribution::Uniform { min: 5.0, max: 20.0 },
                    duration: DurationDistribution::Exponential { mean_s: 10.0 },
                    keepalive_s: Some(2.0),
                },
                ServiceConfig {
                    service_id: "ar".to_string(),
                    arrival: ArrivalConfig::Periodic { period_s: 1.0 },
                    cost: CostDistribution::Constant { value: 10.0 },
                    duration: DurationDistribution::Constant { value_s: 3.0 },
                    keepalive_s: None,
                },
            ],
        }
    }

    fn racks() -> Vec<RackId> {
        vec![RackId::new("r0"), RackId::new("r1")]
    }

    #[test]
    fn test_requests_are_time_ordered() {
        let mut generator = WorkloadGenerator::new(create_test_config(), racks(), 42).unwrap();
        let requests = generator.generate(60.0).unwrap();

        assert!(!requests.is_empty());
        for pair in requests.windows(2) {
            assert!(pair[0].time <= pair[1].time);
        }
        assert!(requests.iter().all(|r| r.time < 60.0));
    }

    #[test]
    fn test_same_seed_same_workload() {
        let a = WorkloadGenerator::new(create_test_config(), racks(), 7)
            .unwrap()
            .generate(30.0)
            .unwrap();
        let b = WorkloadGenerator::new(create_test_config(), racks(), 7)
            .unwrap()
            .generate(30.0)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_session_requests_share_a_rack() {
        let mut generator = WorkloadGenerator::new(create_test_config(), racks(), 1).unwrap();
        let requests = generator.generate(30.0).unwrap();

        let mut homes = std::collections::BTreeMap::new();
        for request in &requests {
            let key = request.input.request.key().clone();
            let home = homes.entry(key).or_insert_with(|| request.input.rack_id.clone());
            assert_eq!(home, &request.input.rack_id);
        }
    }

    #[test]
    fn test_periodic_service_lifecycle() {
        let config = WorkloadConfig {
            services: vec![create_test_config().services.remove(1)],
        };
        let mut generator = WorkloadGenerator::new(config, racks(), 0).unwrap();
        let requests = generator.generate(5.0).unwrap();

        let creates = requests
            .iter()
            .filter(|r| matches!(r.input.request, SessionRequest::CreateSession { .. }))
            .count();
        let removes = requests
            .iter()
            .filter(|r| matches!(r.input.request, SessionRequest::RemoveSession { .. }))
            .count();
        // arrivals at 1..=4, removals at 4 only
        assert_eq!(creates, 4);
        assert_eq!(removes, 1);
        assert_eq!(requests[0].input.rack_id, RackId::new("r0"));
        assert_eq!(requests[1].input.rack_id, RackId::new("r1"));
    }

    #[test]
    fn test_invalid_workloads_rejected() {
        let empty = WorkloadConfig { services: vec![] };
        assert!(empty.validate().is_err());

        let mut config = create_test_config();
        config.services[0].arrival = ArrivalConfig::Poisson { rate: 0.0 };
        assert!(config.validate().is_err());

        let mut config = create_test_config();
        config.services[1].keepalive_s = Some(0.0);
        assert!(config.validate().is_err());

        assert!(WorkloadGenerator::new(create_test_config(), vec![], 0).is_err());
    }
}
