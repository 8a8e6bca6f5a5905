//! Capability traits for pluggable policies and hardware models
//!
//! These traits define the seams where built-in behavior can be replaced by
//! externally supplied implementations.

use crate::config::DvfsTable;
use crate::state::PuReport;
use crate::types::PuIndex;

/// Placement and power policy of a resource manager.
///
/// Implementations are pure: they see the manager's speculative view of every
/// PU and never keep state between calls.
pub trait DispatchStrategy: Send + Sync {
    /// Short name used in logs and reports
    fn name(&self) -> &'static str;

    /// Choose the PU that should host a new session of the given cost, if any can.
    fn place(&self, cost: f64, reports: &[PuReport]) -> Option<PuIndex>;

    /// Target power status for every PU.
    ///
    /// With power-off disabled every PU stays on. Otherwise only PUs that hold
    /// at least one session stay on.
    fn power_policy(&self, reports: &[PuReport], power_off_enabled: bool) -> Vec<bool> {
        reports
            .iter()
            .map(|report| !power_off_enabled || report.has_sessions())
            .collect()
    }

    /// Target DVFS mode for every PU: the process-wide flag, broadcast.
    fn dvfs_policy(&self, reports: &[PuReport], dvfs_enabled: bool) -> Vec<bool> {
        vec![dvfs_enabled; reports.len()]
    }
}

/// Inputs shared by power and temperature models
#[derive(Debug, Clone, Copy)]
pub struct PowerContext<'a> {
    pub status: bool,
    pub utilization: f64,
    pub max_u: f64,
    pub dvfs_index: u32,
    pub dvfs_table: &'a DvfsTable,
}

impl PowerContext<'_> {
    /// Utilization in [0, 1]
    pub fn load(&self) -> f64 {
        if self.max_u <= 0.0 {
            0.0
        } else {
            (self.utilization / self.max_u).clamp(0.0, 1.0)
        }
    }

    /// Relative frequency of the selected operating point (1.0 when unknown)
    pub fn frequency(&self) -> f64 {
        self.dvfs_table
            .get(&self.dvfs_index)
            .map(|point| point.frequency)
            .unwrap_or(1.0)
    }
}

/// Power consumption model of a processing unit
pub trait PowerModel: Send + Sync {
    /// Power draw in watts
    fn power(&self, ctx: &PowerContext<'_>) -> f64;
}

/// Temperature model of a processing unit
pub trait TemperatureModel: Send + Sync {
    /// Temperature in degrees Celsius given the current power draw
    fn temperature(&self, ctx: &PowerContext<'_>, power: f64, ambient: f64) -> f64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DvfsPoint;

    struct FirstFit;

    impl DispatchStrategy for FirstFit {
        fn name(&self) -> &'static str {
            "first_fit"
        }

        fn place(&self, cost: f64, reports: &[PuReport]) -> Option<PuIndex> {
            reports.iter().position(|r| r.residual(cost) >= 0.0)
        }
    }

    #[test]
    fn test_default_power_policy() {
        let mut busy = PuReport::off(100.0, 25.0);
        busy.ongoing_sessions
            .entry("svc".to_string())
            .or_default()
            .insert("a".to_string());
        let idle = PuReport::off(100.0, 25.0);
        let reports = vec![busy, idle];

        assert_eq!(FirstFit.power_policy(&reports, false), vec![true, true]);
        assert_eq!(FirstFit.power_policy(&reports, true), vec![true, false]);
        assert_eq!(FirstFit.dvfs_policy(&reports, true), vec![true, true]);
    }

    #[test]
    fn test_power_context_helpers() {
        let mut table = DvfsTable::new();
        table.insert(50, DvfsPoint { frequency: 0.5 });
        table.insert(100, DvfsPoint { frequency: 1.0 });
        let ctx = PowerContext {
            status: true,
            utilization: 40.0,
            max_u: 80.0,
            dvfs_index: 50,
            dvfs_table: &table,
        };
        assert_eq!(ctx.load(), 0.5);
        assert_eq!(ctx.frequency(), 0.5);
    }
}
