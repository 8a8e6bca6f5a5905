//! State reports exchanged between processing units, resource managers and
//! telemetry consumers.

use crate::types::{RackId, SessionKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Open sessions grouped by service
pub type OngoingSessions = BTreeMap<String, BTreeSet<String>>;

/// Snapshot of a processing unit's observable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuReport {
    /// Whether the PU is powered on (flips as soon as a status change is accepted)
    pub status: bool,
    /// Standing DVFS preference
    pub dvfs_mode: bool,
    /// Selected DVFS operating point (0 when off, 100 at full speed)
    pub dvfs_index: u32,
    /// Capacity consumed by open sessions
    pub utilization: f64,
    /// Maximum capacity of the PU
    pub max_u: f64,
    /// Power consumption in watts
    pub power: f64,
    /// Temperature in degrees Celsius
    pub temperature: f64,
    /// Sessions currently open on the PU
    pub ongoing_sessions: OngoingSessions,
}

impl PuReport {
    /// Report of a PU that is powered off and empty
    pub fn off(max_u: f64, ambient_temperature: f64) -> Self {
        Self {
            status: false,
            dvfs_mode: false,
            dvfs_index: 0,
            utilization: 0.0,
            max_u,
            power: 0.0,
            temperature: ambient_temperature,
            ongoing_sessions: OngoingSessions::new(),
        }
    }

    /// Number of open sessions across all services
    pub fn session_count(&self) -> usize {
        self.ongoing_sessions.values().map(|s| s.len()).sum()
    }

    /// Whether at least one session is open
    pub fn has_sessions(&self) -> bool {
        self.ongoing_sessions.values().any(|s| !s.is_empty())
    }

    /// Whether the given session is open on this PU
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.ongoing_sessions
            .get(&key.service_id)
            .map(|sessions| sessions.contains(&key.session_id))
            .unwrap_or(false)
    }

    /// Headroom left after hypothetically placing a session of the given cost
    pub fn residual(&self, cost: f64) -> f64 {
        self.max_u - self.utilization - cost
    }

    /// Utilization as a percentage of the maximum capacity
    pub fn relative_utilization(&self) -> f64 {
        if self.max_u <= 0.0 {
            0.0
        } else {
            self.utilization / self.max_u * 100.0
        }
    }
}

/// Aggregate report of every PU managed by one resource manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RackReport {
    pub rack_id: RackId,
    pub pus: Vec<PuReport>,
}

impl RackReport {
    pub fn new(rack_id: RackId, pus: Vec<PuReport>) -> Self {
        Self { rack_id, pus }
    }

    pub fn total_power(&self) -> f64 {
        self.pus.iter().map(|pu| pu.power).sum()
    }

    pub fn total_utilization(&self) -> f64 {
        self.pus.iter().map(|pu| pu.utilization).sum()
    }

    pub fn total_capacity(&self) -> f64 {
        self.pus.iter().map(|pu| pu.max_u).sum()
    }

    pub fn max_temperature(&self) -> Option<f64> {
        self.pus
            .iter()
            .map(|pu| pu.temperature)
            .fold(None, |acc, t| Some(acc.map_or(t, |m: f64| m.max(t))))
    }

    /// Number of PUs currently powered on
    pub fn pus_on(&self) -> usize {
        self.pus.iter().filter(|pu| pu.status).count()
    }

    /// Number of open sessions across the rack
    pub fn session_count(&self) -> usize {
        self.pus.iter().map(|pu| pu.session_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_with(sessions: &[(&str, &str)], utilization: f64) -> PuReport {
        let mut report = PuReport::off(100.0, 25.0);
        report.status = true;
        report.utilization = utilization;
        for (service, session) in sessions {
            report
                .ongoing_sessions
                .entry(service.to_string())
                .or_default()
                .insert(session.to_string());
        }
        report
    }

    #[test]
    fn test_off_report() {
        let report = PuReport::off(100.0, 25.0);
        assert!(!report.status);
        assert_eq!(report.dvfs_index, 0);
        assert_eq!(report.temperature, 25.0);
        assert!(!report.has_sessions());
    }

    #[test]
    fn test_session_lookup() {
        let report = report_with(&[("svc", "a"), ("svc", "b"), ("other", "a")], 30.0);
        assert_eq!(report.session_count(), 3);
        assert!(report.contains(&SessionKey::new("svc", "b")));
        assert!(!report.contains(&SessionKey::new("svc", "c")));
        assert!(report.has_sessions());
    }

    #[test]
    fn test_residual() {
        let report = report_with(&[], 90.0);
        assert_eq!(report.residual(20.0), -10.0);
        assert_eq!(report.relative_utilization(), 90.0);
    }

    #[test]
    fn test_rack_aggregates() {
        let mut a = report_with(&[("svc", "a")], 40.0);
        a.power = 120.0;
        a.temperature = 40.0;
        let b = PuReport::off(100.0, 25.0);
        let rack = RackReport::new(RackId::new("rack_0"), vec![a, b]);

        assert_eq!(rack.total_power(), 120.0);
        assert_eq!(rack.total_utilization(), 40.0);
        assert_eq!(rack.total_capacity(), 200.0);
        assert_eq!(rack.max_temperature(), Some(40.0));
        assert_eq!(rack.pus_on(), 1);
        assert_eq!(rack.session_count(), 1);
    }
}
