use std::collections::BTreeMap;

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use edc_core::{Error, RackId, RackReport, Result, SessionKey, SessionRequest, SessionResponse};

use crate::edc::EdcOutput;
use crate::engine::SimTime;
use crate::rack::RackOutput;

/// Largest admission latency tracked: one hour, in microseconds
const MAX_LATENCY_US: u64 = 3_600_000_000;

/// Metrics collector for one simulation run
#[derive(Debug)]
pub struct Metrics {
    /// Time from create request to create response, in microseconds of simulated time
    admission_latency: Histogram<u64>,
    counters: SessionCounters,
    pending_creates: BTreeMap<SessionKey, SimTime>,
    racks: BTreeMap<RackId, RackReport>,
    last_time: SimTime,
    energy_j: f64,
    peak_power_w: f64,
    peak_utilization: f64,
}

/// Session request and response counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub create_requests: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub remove_requests: u64,
    pub removed: u64,
    pub ongoing_requests: u64,
    pub ongoing_confirmed: u64,
    pub ongoing_denied: u64,
}

impl SessionCounters {
    /// Share of answered create requests that were accepted
    pub fn acceptance_rate(&self) -> f64 {
        let answered = self.accepted + self.rejected;
        if answered == 0 {
            0.0
        } else {
            self.accepted as f64 / answered as f64
        }
    }
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let admission_latency = Histogram::new_with_bounds(1, MAX_LATENCY_US, 3)
            .map_err(|e| Error::internal(format!("Cannot create latency histogram: {}", e)))?;
        Ok(Self {
            admission_latency,
            counters: SessionCounters::default(),
            pending_creates: BTreeMap::new(),
            racks: BTreeMap::new(),
            last_time: 0.0,
            energy_j: 0.0,
            peak_power_w: 0.0,
            peak_utilization: 0.0,
        })
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// Total power drawn by every rack right now
    pub fn current_power(&self) -> f64 {
        self.racks.values().map(RackReport::total_power).sum()
    }

    /// Utilization of the whole data center relative to its capacity
    pub fn current_utilization(&self) -> f64 {
        let capacity: f64 = self.racks.values().map(RackReport::total_capacity).sum();
        if capacity <= 0.0 {
            return 0.0;
        }
        self.racks.values().map(RackReport::total_utilization).sum::<f64>() / capacity
    }

    pub fn energy_j(&self) -> f64 {
        self.energy_j
    }

    /// Integrate power up to `t`
    pub fn advance(&mut self, t: SimTime) {
        if t > self.last_time {
            self.energy_j += self.current_power() * (t - self.last_time);
            self.last_time = t;
        }
    }

    /// Record a request entering the data center
    pub fn record_request(&mut self, t: SimTime, request: &SessionRequest) {
        self.advance(t);
        match request {
            SessionRequest::CreateSession { key, .. } => {
                self.counters.create_requests += 1;
                self.pending_creates.entry(key.clone()).or_insert(t);
            }
            SessionRequest::RemoveSession { .. } => self.counters.remove_requests += 1,
            SessionRequest::OngoingSession { .. } => self.counters.ongoing_requests += 1,
        }
    }

    /// Record an output leaving the data center
    pub fn record_output(&mut self, t: SimTime, output: &EdcOutput) {
        self.advance(t);
        match &output.output {
            RackOutput::Response(response) => self.record_response(t, response),
            RackOutput::Report(report) => {
                self.racks.insert(output.rack_id.clone(), report.clone());
                self.peak_power_w = self.peak_power_w.max(self.current_power());
                self.peak_utilization = self.peak_utilization.max(self.current_utilization());
            }
        }
    }

    fn record_response(&mut self, t: SimTime, response: &SessionResponse) {
        match response {
            SessionResponse::CreateSession { key, accepted } => {
                if let Some(requested) = self.pending_creates.remove(key) {
                    let latency_us = ((t - requested) * 1e6).round() as u64;
                    self.admission_latency.saturating_record(latency_us);
                }
                if *accepted {
                    self.counters.accepted += 1;
                } else {
                    self.counters.rejected += 1;
                }
            }
            SessionResponse::RemoveSession { accepted, .. } => {
                if *accepted {
                    self.counters.removed += 1;
                }
            }
            SessionResponse::OngoingSession { accepted, .. } => {
                if *accepted {
                    self.counters.ongoing_confirmed += 1;
                } else {
                    self.counters.ongoing_denied += 1;
                }
            }
        }
    }

    /// Admission latency percentiles in milliseconds
    pub fn admission_latency(&self) -> Option<LatencyPercentiles> {
        let histogram = &self.admission_latency;
        if histogram.is_empty() {
            return None;
        }

        let ms = |us: u64| us as f64 / 1000.0;
        Some(LatencyPercentiles {
            p50: ms(histogram.value_at_percentile(50.0)),
            p95: ms(histogram.value_at_percentile(95.0)),
            p99: ms(histogram.value_at_percentile(99.0)),
            mean: histogram.mean() / 1000.0,
            max: ms(histogram.max()),
            count: histogram.len(),
        })
    }

    /// Generate a summary report for a run that ended at `end`
    pub fn generate_summary(&mut self, strategy: &str, end: SimTime) -> MetricsSummary {
        self.advance(end);
        let average_power_w = if end > 0.0 { self.energy_j / end } else { 0.0 };
        let open_sessions = self.racks.values().map(RackReport::session_count).sum();

        MetricsSummary {
            strategy: strategy.to_string(),
            duration_s: end,
            counters: self.counters.clone(),
            acceptance_rate: self.counters.acceptance_rate(),
            admission_latency_ms: self.admission_latency(),
            energy_j: self.energy_j,
            average_power_w,
            peak_power_w: self.peak_power_w,
            peak_utilization: self.peak_utilization,
            open_sessions,
            pus_on: self.racks.values().map(RackReport::pus_on).sum(),
        }
    }
}

/// Latency percentiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub max: f64,
    pub count: u64,
}

/// Complete metrics summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub strategy: String,
    pub duration_s: f64,
    pub counters: SessionCounters,
    pub acceptance_rate: f64,
    pub admission_latency_ms: Option<LatencyPercentiles>,
    pub energy_j: f64,
    pub average_power_w: f64,
    pub peak_power_w: f64,
    pub peak_utilization: f64,
    /// Sessions still open when the run ended
    pub open_sessions: usize,
    pub pus_on: usize,
}

impl MetricsSummary {
    pub const CSV_HEADER: &'static str = "strategy,duration_s,create_requests,accepted,rejected,removed,\
acceptance_rate,admission_p50_ms,admission_p95_ms,admission_p99_ms,energy_j,average_power_w,\
peak_power_w,peak_utilization,open_sessions,pus_on";

    /// One CSV row, matching `CSV_HEADER`
    pub fn csv_row(&self) -> String {
        let (p50, p95, p99) = self
            .admission_latency_ms
            .as_ref()
            .map_or((0.0, 0.0, 0.0), |l| (l.p50, l.p95, l.p99));
        format!(
            "{},{},{},{},{},{},{:.4},{},{},{},{:.3},{:.3},{:.3},{:.4},{},{}",
            self.strategy,
            self.duration_s,
            self.counters.create_requests,
            self.counters.accepted,
            self.counters.rejected,
            self.counters.removed,
            self.acceptance_rate,
            p50,
            p95,
            p99,
            self.energy_j,
            self.average_power_w,
            self.peak_power_w,
            self.peak_utilization,
            self.open_sessions,
            self.pus_on,
        )
    }

    /// Export to CSV format
    pub fn to_csv(&self) -> anyhow::Result<String> {
        Ok(format!("{}\n{}\n", Self::CSV_HEADER, self.csv_row()))
    }

    /// Export to JSON format
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
