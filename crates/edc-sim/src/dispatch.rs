//! Built-in dispatching strategies
//!
//! Both strategies scan every PU in index order and compare the residual
//! capacity `max_u - utilization - cost` each PU would keep after the
//! placement. Ties always keep the earliest index.

use edc_core::{DispatchStrategy, PuIndex, PuReport, StrategyType};

/// Places new sessions on the PU with the most residual capacity,
/// spreading load across the rack.
#[derive(Debug, Clone, Default)]
pub struct EmptiestPu;

impl DispatchStrategy for EmptiestPu {
    fn name(&self) -> &'static str {
        "emptiest"
    }

    fn place(&self, cost: f64, reports: &[PuReport]) -> Option<PuIndex> {
        let mut best: Option<(PuIndex, f64)> = None;
        for (index, report) in reports.iter().enumerate() {
            let residual = report.residual(cost);
            if residual.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, r)| residual > r) {
                best = Some((index, residual));
            }
        }
        best.filter(|(_, residual)| *residual >= 0.0)
            .map(|(index, _)| index)
    }
}

/// Places new sessions on the PU with the least non-negative residual
/// capacity, packing load so that other PUs can be powered down.
#[derive(Debug, Clone, Default)]
pub struct FullestPu;

impl DispatchStrategy for FullestPu {
    fn name(&self) -> &'static str {
        "fullest"
    }

    fn place(&self, cost: f64, reports: &[PuReport]) -> Option<PuIndex> {
        let mut best: Option<(PuIndex, f64)> = None;
        for (index, report) in reports.iter().enumerate() {
            let residual = report.residual(cost);
            if residual.is_nan() || residual < 0.0 {
                continue;
            }
            if best.map_or(true, |(_, r)| residual < r) {
                best = Some((index, residual));
            }
        }
        best.map(|(index, _)| index)
    }
}

/// Factory for creating dispatching strategies
pub struct StrategyFactory;

impl StrategyFactory {
    /// Create a dispatching strategy from its configured type
    pub fn create_strategy(strategy: StrategyType) -> Box<dyn DispatchStrategy> {
        match strategy {
            StrategyType::EmptiestPu => Box::new(EmptiestPu),
            StrategyType::FullestPu => Box::new(FullestPu),
        }
    }
}
