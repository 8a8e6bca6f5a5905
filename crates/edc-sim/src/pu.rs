//! Processing unit: one schedulable compute resource.
//!
//! A PU owns its sessions, utilization, power, temperature and DVFS state.
//! It is a timed state machine:
//!
//! ```text
//!   START ──► OFF ──status(on)──► TO_ON ──t_on──► ON ◄──► BUSY
//!              ▲                                   │
//!              └────────t_off──── TO_OFF ◄─status(off)
//! ```
//!
//! Commands received during TO_ON / TO_OFF are deferred and replayed, in
//! arrival order, the instant the transition completes.

use std::collections::{BTreeMap, VecDeque};

use edc_core::{
    Error, PowerContext, PowerModel, PuConfig, PuIndex, PuReport, RequestId, Result, SessionKey,
    TemperatureModel, FULL_SPEED_DVFS_INDEX,
};
use tracing::{debug, warn};

use crate::engine::{Atomic, SimTime, INFINITY};
use crate::power::{build_power_model, build_temperature_model};

/// Slack allowed when comparing capacity sums computed in different orders
pub const CAPACITY_TOLERANCE: f64 = 1e-9;

/// Commands accepted by a processing unit
#[derive(Debug, Clone, PartialEq)]
pub enum PuCommand {
    ChangeStatus(bool),
    SetDvfsMode(bool),
    OpenSession { key: SessionKey, cost: f64 },
    CloseSession { key: SessionKey },
    OngoingSession { key: SessionKey, request_id: RequestId },
}

impl PuCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            PuCommand::ChangeStatus(_) => "change_status",
            PuCommand::SetDvfsMode(_) => "set_dvfs_mode",
            PuCommand::OpenSession { .. } => "open_session",
            PuCommand::CloseSession { .. } => "close_session",
            PuCommand::OngoingSession { .. } => "ongoing_session",
        }
    }
}

/// Acknowledgments emitted by a processing unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PuAck {
    Status(bool),
    Dvfs(bool),
    Open { key: SessionKey, accepted: bool },
    Close { key: SessionKey, accepted: bool },
    Ongoing { key: SessionKey, request_id: RequestId, accepted: bool },
}

impl PuAck {
    pub fn accepted(&self) -> bool {
        match self {
            PuAck::Status(accepted) | PuAck::Dvfs(accepted) => *accepted,
            PuAck::Open { accepted, .. }
            | PuAck::Close { accepted, .. }
            | PuAck::Ongoing { accepted, .. } => *accepted,
        }
    }
}

/// Everything a PU emits
#[derive(Debug, Clone, PartialEq)]
pub enum PuOutput {
    Ack(PuAck),
    Report(PuReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuPhase {
    Start,
    Off,
    On,
    Busy,
    ToOn,
    ToOff,
}

/// FIFO of work accepted but not yet admitted
#[derive(Debug, Clone)]
pub struct TaskQueue<T> {
    items: VecDeque<T>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self { items: VecDeque::new() }
    }
}

impl<T> TaskQueue<T> {
    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Remove the first item matching the predicate
    pub fn remove_first(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let position = self.items.iter().position(pred)?;
        self.items.remove(position)
    }
}

#[derive(Debug, Clone)]
struct PendingStart {
    key: SessionKey,
    cost: f64,
}

#[derive(Debug, Clone, Copy)]
struct StartTimer {
    deadline: SimTime,
    cost: f64,
}

pub struct ProcessingUnit {
    index: PuIndex,
    config: PuConfig,
    power_model: Option<Box<dyn PowerModel>>,
    temperature_model: Option<Box<dyn TemperatureModel>>,

    phase: PuPhase,
    clock: SimTime,
    transition_deadline: SimTime,

    status: bool,
    dvfs_mode: bool,
    dvfs_index: u32,
    utilization: f64,
    power: f64,
    temperature: f64,

    /// Open sessions and their cost; stopping sessions stay here until removed
    active: BTreeMap<SessionKey, f64>,
    start_buffer: TaskQueue<PendingStart>,
    starting: BTreeMap<SessionKey, StartTimer>,
    stop_buffer: TaskQueue<SessionKey>,
    stopping: BTreeMap<SessionKey, SimTime>,
    checks: BTreeMap<(SessionKey, RequestId), SimTime>,
    deferred: VecDeque<PuCommand>,

    outbox: Vec<PuOutput>,
    report_dirty: bool,
}

impl ProcessingUnit {
    /// Create a PU with the power and temperature models named in its configuration
    pub fn new(index: PuIndex, config: PuConfig) -> Result<Self> {
        config.validate()?;

        let power_model = config.power_model.as_ref().map(build_power_model);
        let temperature_model = config.temperature_model.as_ref().map(build_temperature_model);
        let temperature = config.ambient_temperature;

        Ok(Self {
            index,
            config,
            power_model,
            temperature_model,
            phase: PuPhase::Start,
            clock: 0.0,
            transition_deadline: INFINITY,
            status: false,
            dvfs_mode: false,
            dvfs_index: 0,
            utilization: 0.0,
            power: 0.0,
            temperature,
            active: BTreeMap::new(),
            start_buffer: TaskQueue::default(),
            starting: BTreeMap::new(),
            stop_buffer: TaskQueue::default(),
            stopping: BTreeMap::new(),
            checks: BTreeMap::new(),
            deferred: VecDeque::new(),
            outbox: Vec::new(),
            report_dirty: false,
        })
    }

    /// Replace the configured power model
    pub fn with_power_model(mut self, model: Box<dyn PowerModel>) -> Self {
        self.power_model = Some(model);
        self
    }

    /// Replace the configured temperature model
    pub fn with_temperature_model(mut self, model: Box<dyn TemperatureModel>) -> Self {
        self.temperature_model = Some(model);
        self
    }

    pub fn index(&self) -> PuIndex {
        self.index
    }

    pub fn config(&self) -> &PuConfig {
        &self.config
    }

    pub fn phase(&self) -> PuPhase {
        self.phase
    }

    pub fn utilization(&self) -> f64 {
        self.utilization
    }

    /// Sessions starting or stopping right now
    pub fn in_transit(&self) -> usize {
        self.starting.len() + self.stopping.len()
    }

    /// Current observable state
    pub fn report(&self) -> PuReport {
        let mut report = PuReport::off(self.config.max_u, self.config.ambient_temperature);
        report.status = self.status;
        report.dvfs_mode = self.dvfs_mode;
        report.dvfs_index = self.dvfs_index;
        report.utilization = self.utilization;
        report.power = self.power;
        report.temperature = self.temperature;
        for key in self.active.keys() {
            report
                .ongoing_sessions
                .entry(key.service_id.clone())
                .or_default()
                .insert(key.session_id.clone());
        }
        report
    }

    fn is_starting(&self, key: &SessionKey) -> bool {
        self.starting.contains_key(key) || self.start_buffer.iter().any(|p| &p.key == key)
    }

    fn is_removing(&self, key: &SessionKey) -> bool {
        self.stopping.contains_key(key) || self.stop_buffer.iter().any(|k| k == key)
    }

    fn is_acking(&self, key: &SessionKey) -> bool {
        self.checks.keys().any(|(k, _)| k == key)
    }

    /// Capacity promised to open sessions plus every start not yet completed
    fn reserved(&self) -> f64 {
        self.utilization
            + self.start_buffer.iter().map(|p| p.cost).sum::<f64>()
            + self.starting.values().map(|t| t.cost).sum::<f64>()
    }

    fn has_tasks(&self) -> bool {
        !self.start_buffer.is_empty()
            || !self.starting.is_empty()
            || !self.stop_buffer.is_empty()
            || !self.stopping.is_empty()
            || !self.checks.is_empty()
    }

    fn below_ceiling(&self) -> bool {
        self.config.unlimited_start_stop() || (self.in_transit() as i64) < self.config.max_start_stop as i64
    }

    fn start_fits(&self, cost: f64) -> bool {
        let starting: f64 = self.starting.values().map(|t| t.cost).sum();
        self.utilization + starting + cost <= self.config.max_u + CAPACITY_TOLERANCE
    }

    fn admissible(&self) -> bool {
        if !self.below_ceiling() {
            return false;
        }
        !self.stop_buffer.is_empty()
            || self.start_buffer.front().map_or(false, |p| self.start_fits(p.cost))
    }

    fn next_deadline(&self) -> Option<SimTime> {
        self.starting
            .values()
            .map(|t| t.deadline)
            .chain(self.stopping.values().copied())
            .chain(self.checks.values().copied())
            .reduce(f64::min)
    }

    /// Absolute time of the next internal event
    fn next_event_time(&self) -> SimTime {
        if !self.outbox.is_empty() {
            return self.clock;
        }
        match self.phase {
            PuPhase::Start => self.clock,
            PuPhase::Off | PuPhase::On => INFINITY,
            PuPhase::ToOn | PuPhase::ToOff => self.transition_deadline.max(self.clock),
            PuPhase::Busy => {
                if self.admissible() {
                    self.clock
                } else {
                    self.next_deadline().map(|d| d.max(self.clock)).unwrap_or(INFINITY)
                }
            }
        }
    }

    fn ack(&mut self, ack: PuAck) {
        if !ack.accepted() {
            debug!(pu = self.index, ?ack, "negative acknowledgment");
        }
        self.outbox.push(PuOutput::Ack(ack));
    }

    /// Recompute utilization, DVFS index, power and temperature
    fn refresh(&mut self) {
        self.utilization = self.active.values().sum();

        self.dvfs_index = if !self.status {
            0
        } else if !self.dvfs_mode {
            FULL_SPEED_DVFS_INDEX
        } else {
            let relative = self.utilization / self.config.max_u * 100.0;
            self.config
                .dvfs_table
                .keys()
                .copied()
                .find(|index| *index as f64 + CAPACITY_TOLERANCE >= relative)
                .unwrap_or(FULL_SPEED_DVFS_INDEX)
        };

        let ctx = PowerContext {
            status: self.status,
            utilization: self.utilization,
            max_u: self.config.max_u,
            dvfs_index: self.dvfs_index,
            dvfs_table: &self.config.dvfs_table,
        };
        let ambient = self.config.ambient_temperature;
        self.power = self.power_model.as_ref().map_or(0.0, |m| m.power(&ctx));
        self.temperature = self
            .temperature_model
            .as_ref()
            .map_or(ambient, |m| m.temperature(&ctx, self.power, ambient));
        self.report_dirty = true;
    }

    fn set_dvfs_mode(&mut self, mode: bool) {
        if self.dvfs_mode != mode {
            self.dvfs_mode = mode;
            self.refresh();
        }
        self.ack(PuAck::Dvfs(true));
    }

    fn handle(&mut self, command: PuCommand) {
        debug!(pu = self.index, phase = ?self.phase, command = command.kind(), "command received");
        match self.phase {
            PuPhase::ToOn | PuPhase::ToOff => self.deferred.push_back(command),
            PuPhase::Start | PuPhase::Off => self.handle_off(command),
            PuPhase::On | PuPhase::Busy => self.handle_on(command),
        }
    }

    fn handle_off(&mut self, command: PuCommand) {
        match command {
            PuCommand::ChangeStatus(true) => {
                self.status = true;
                self.phase = PuPhase::ToOn;
                self.transition_deadline = self.clock + self.config.t_on;
                self.refresh();
                self.ack(PuAck::Status(true));
            }
            PuCommand::ChangeStatus(false) => self.ack(PuAck::Status(true)),
            PuCommand::SetDvfsMode(mode) => self.set_dvfs_mode(mode),
            PuCommand::OpenSession { key, .. } => self.ack(PuAck::Open { key, accepted: false }),
            PuCommand::CloseSession { key } => self.ack(PuAck::Close { key, accepted: true }),
            PuCommand::OngoingSession { key, request_id } => self.ack(PuAck::Ongoing {
                key,
                request_id,
                accepted: false,
            }),
        }
    }

    fn handle_on(&mut self, command: PuCommand) {
        match command {
            PuCommand::ChangeStatus(true) => self.ack(PuAck::Status(true)),
            PuCommand::ChangeStatus(false) => {
                let idle = self.active.is_empty()
                    && self.start_buffer.is_empty()
                    && self.starting.is_empty();
                if idle {
                    self.status = false;
                    self.phase = PuPhase::ToOff;
                    self.transition_deadline = self.clock + self.config.t_off;
                    self.refresh();
                    self.ack(PuAck::Status(true));
                } else {
                    warn!(pu = self.index, sessions = self.active.len(), "refusing to power off a PU in use");
                    self.ack(PuAck::Status(false));
                }
            }
            PuCommand::SetDvfsMode(mode) => self.set_dvfs_mode(mode),
            PuCommand::OpenSession { key, cost } => {
                let duplicate = self.active.contains_key(&key) || self.is_starting(&key);
                if !duplicate && self.reserved() + cost <= self.config.max_u + CAPACITY_TOLERANCE {
                    self.start_buffer.push(PendingStart { key, cost });
                } else {
                    self.ack(PuAck::Open { key, accepted: false });
                }
            }
            PuCommand::CloseSession { key } => {
                if self.is_removing(&key) {
                    debug!(pu = self.index, session = %key, "close already in progress, ignoring");
                } else if self.active.contains_key(&key) {
                    if self.is_acking(&key) {
                        self.ack(PuAck::Close { key, accepted: false });
                    } else {
                        self.stop_buffer.push(key);
                    }
                } else if self.is_starting(&key) {
                    // Cancelled before completion: the start timer is dropped with it
                    self.start_buffer.remove_first(|p| p.key == key);
                    self.starting.remove(&key);
                    self.ack(PuAck::Open { key: key.clone(), accepted: false });
                    self.ack(PuAck::Close { key, accepted: true });
                } else {
                    self.ack(PuAck::Close { key, accepted: true });
                }
            }
            PuCommand::OngoingSession { key, request_id } => {
                if self.active.contains_key(&key) && !self.is_removing(&key) {
                    let deadline = self.clock + self.config.t_operation;
                    self.checks.insert((key, request_id), deadline);
                } else {
                    self.ack(PuAck::Ongoing {
                        key,
                        request_id,
                        accepted: false,
                    });
                }
            }
        }
    }

    /// Complete due tasks, then admit at most one stop and one start
    fn step(&mut self) {
        let now = self.clock;
        let mut changed = false;

        let started: Vec<SessionKey> = self
            .starting
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in started {
            if let Some(timer) = self.starting.remove(&key) {
                self.active.insert(key.clone(), timer.cost);
                changed = true;
                self.ack(PuAck::Open { key, accepted: true });
            }
        }

        let stopped: Vec<SessionKey> = self
            .stopping
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stopped {
            self.stopping.remove(&key);
            if self.active.remove(&key).is_some() {
                changed = true;
            }
            self.ack(PuAck::Close { key, accepted: true });
        }

        let checked: Vec<(SessionKey, RequestId)> = self
            .checks
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for (key, request_id) in checked {
            self.checks.remove(&(key.clone(), request_id));
            let accepted = self.active.contains_key(&key);
            self.ack(PuAck::Ongoing {
                key,
                request_id,
                accepted,
            });
        }

        if changed {
            self.refresh();
        }

        if self.below_ceiling() {
            if let Some(key) = self.stop_buffer.pop() {
                self.stopping.insert(key, now + self.config.t_stop);
            }
        }
        if self.below_ceiling() {
            let fits = self.start_buffer.front().map_or(false, |p| self.start_fits(p.cost));
            if fits {
                if let Some(pending) = self.start_buffer.pop() {
                    let timer = StartTimer {
                        deadline: now + self.config.t_start,
                        cost: pending.cost,
                    };
                    self.starting.insert(pending.key, timer);
                }
            }
        }
    }

    /// Settle ON/BUSY according to pending work and queue the report if needed
    fn settle(&mut self) {
        if matches!(self.phase, PuPhase::On | PuPhase::Busy) {
            self.phase = if self.has_tasks() { PuPhase::Busy } else { PuPhase::On };
        }
        if self.report_dirty {
            self.report_dirty = false;
            let report = self.report();
            self.outbox.push(PuOutput::Report(report));
        }
    }

    fn replay_deferred(&mut self) {
        let deferred: Vec<PuCommand> = self.deferred.drain(..).collect();
        for command in deferred {
            self.handle(command);
        }
    }
}

impl Atomic for ProcessingUnit {
    type Input = PuCommand;
    type Output = PuOutput;

    fn initialize(&mut self) {
        self.phase = PuPhase::Start;
        self.clock = 0.0;
        self.refresh();
        self.settle();
    }

    fn time_advance(&self) -> SimTime {
        let next = self.next_event_time();
        if next == INFINITY {
            INFINITY
        } else {
            next - self.clock
        }
    }

    fn output(&self) -> Vec<PuOutput> {
        self.outbox.clone()
    }

    fn internal_transition(&mut self) -> Result<()> {
        let next = self.next_event_time();
        if next == INFINITY {
            return Err(Error::internal(format!("PU {} has no pending internal event", self.index)));
        }
        self.clock = next;
        self.outbox.clear();

        match self.phase {
            PuPhase::Start => self.phase = PuPhase::Off,
            PuPhase::ToOn if self.transition_deadline <= self.clock => {
                debug!(pu = self.index, "powered on");
                self.phase = PuPhase::On;
                self.transition_deadline = INFINITY;
                self.replay_deferred();
            }
            PuPhase::ToOff if self.transition_deadline <= self.clock => {
                debug!(pu = self.index, "powered off");
                self.phase = PuPhase::Off;
                self.transition_deadline = INFINITY;
                self.replay_deferred();
            }
            PuPhase::Busy => self.step(),
            _ => {}
        }

        self.settle();
        Ok(())
    }

    fn external_transition(&mut self, elapsed: SimTime, inputs: Vec<PuCommand>) -> Result<()> {
        self.clock += elapsed;
        for command in inputs {
            self.handle(command);
        }
        self.settle();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Simulator;
    use edc_core::{DvfsPoint, DvfsTable, PowerModelConfig};

    fn config() -> PuConfig {
        PuConfig {
            t_on: 1.0,
            t_off: 1.0,
            t_start: 0.5,
            t_stop: 0.5,
            t_operation: 0.25,
            ..PuConfig::default()
        }
    }

    fn key(session: &str) -> SessionKey {
        SessionKey::new("svc", session)
    }

    fn open(session: &str, cost: f64) -> PuCommand {
        PuCommand::OpenSession { key: key(session), cost }
    }

    fn close(session: &str) -> PuCommand {
        PuCommand::CloseSession { key: key(session) }
    }

    struct Harness {
        sim: Simulator<ProcessingUnit>,
        log: Vec<(SimTime, PuOutput)>,
    }

    impl Harness {
        fn new(config: PuConfig) -> Self {
            let mut sim = Simulator::new(ProcessingUnit::new(0, config).unwrap());
            sim.initialize(0.0);
            let mut harness = Self { sim, log: Vec::new() };
            harness.advance(0.0);
            harness
        }

        fn fire(&mut self, t: SimTime, inputs: Vec<PuCommand>) {
            for output in self.sim.collect(t) {
                self.log.push((t, output));
            }
            self.sim.transition(t, inputs).unwrap();
        }

        fn advance(&mut self, until: SimTime) {
            while self.sim.next_time() <= until {
                let t = self.sim.next_time();
                self.fire(t, vec![]);
            }
        }

        fn send(&mut self, t: SimTime, inputs: Vec<PuCommand>) {
            while self.sim.next_time() < t {
                let next = self.sim.next_time();
                self.fire(next, vec![]);
            }
            self.fire(t, inputs);
            self.advance(t);
        }

        fn acks(&self) -> Vec<(SimTime, PuAck)> {
            self.log
                .iter()
                .filter_map(|(t, o)| match o {
                    PuOutput::Ack(ack) => Some((*t, ack.clone())),
                    PuOutput::Report(_) => None,
                })
                .collect()
        }

        fn reports(&self) -> Vec<PuReport> {
            self.log
                .iter()
                .filter_map(|(_, o)| match o {
                    PuOutput::Report(report) => Some(report.clone()),
                    PuOutput::Ack(_) => None,
                })
                .collect()
        }

        fn pu(&self) -> &ProcessingUnit {
            self.sim.model()
        }

        fn power_on(&mut self) {
            self.send(0.0, vec![PuCommand::ChangeStatus(true)]);
            self.advance(1.0);
            assert_eq!(self.pu().phase(), PuPhase::On);
        }
    }

    #[test]
    fn test_initial_report_and_off() {
        let harness = Harness::new(config());
        assert_eq!(harness.pu().phase(), PuPhase::Off);
        let reports = harness.reports();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].status);
        assert_eq!(reports[0].dvfs_index, 0);
    }

    #[test]
    fn test_off_answers_immediately() {
        let mut harness = Harness::new(config());
        harness.send(
            2.0,
            vec![
                open("a", 10.0),
                close("b"),
                PuCommand::OngoingSession { key: key("c"), request_id: 1 },
                PuCommand::ChangeStatus(false),
            ],
        );

        let acks = harness.acks();
        assert_eq!(
            acks,
            vec![
                (2.0, PuAck::Open { key: key("a"), accepted: false }),
                (2.0, PuAck::Close { key: key("b"), accepted: true }),
                (2.0, PuAck::Ongoing { key: key("c"), request_id: 1, accepted: false }),
                (2.0, PuAck::Status(true)),
            ]
        );
        // no state change, no report besides the initial one
        assert_eq!(harness.reports().len(), 1);
        assert_eq!(harness.pu().phase(), PuPhase::Off);
    }

    #[test]
    fn test_power_on_acks_on_receipt() {
        let mut harness = Harness::new(config());
        harness.send(0.0, vec![PuCommand::ChangeStatus(true)]);

        assert_eq!(harness.acks(), vec![(0.0, PuAck::Status(true))]);
        assert_eq!(harness.pu().phase(), PuPhase::ToOn);
        let last = harness.reports().pop().unwrap();
        assert!(last.status);
        assert_eq!(last.dvfs_index, FULL_SPEED_DVFS_INDEX);

        harness.advance(1.0);
        assert_eq!(harness.pu().phase(), PuPhase::On);
    }

    #[test]
    fn test_open_session_lifecycle() {
        let mut harness = Harness::new(config());
        harness.power_on();

        harness.send(2.0, vec![open("a", 40.0)]);
        assert_eq!(harness.pu().phase(), PuPhase::Busy);
        assert_eq!(harness.pu().utilization(), 0.0);

        harness.advance(10.0);
        assert_eq!(harness.acks().last().unwrap(), &(2.5, PuAck::Open { key: key("a"), accepted: true }));
        assert_eq!(harness.pu().phase(), PuPhase::On);
        assert_eq!(harness.pu().utilization(), 40.0);

        let report = harness.reports().pop().unwrap();
        assert!(report.contains(&key("a")));
        assert_eq!(report.utilization, 40.0);
    }

    #[test]
    fn test_capacity_counts_pending_starts() {
        let mut harness = Harness::new(config());
        harness.power_on();

        harness.send(2.0, vec![open("a", 60.0), open("b", 50.0)]);
        assert_eq!(
            harness.acks().last().unwrap(),
            &(2.0, PuAck::Open { key: key("b"), accepted: false })
        );

        harness.advance(10.0);
        assert_eq!(harness.pu().utilization(), 60.0);
    }

    #[test]
    fn test_duplicate_open_rejected() {
        let mut harness = Harness::new(config());
        harness.power_on();

        harness.send(2.0, vec![open("a", 10.0)]);
        harness.send(2.25, vec![open("a", 10.0)]);
        assert_eq!(
            harness.acks().last().unwrap(),
            &(2.25, PuAck::Open { key: key("a"), accepted: false })
        );
        harness.advance(10.0);
        assert_eq!(harness.pu().utilization(), 10.0);
    }

    #[test]
    fn test_start_stop_ceiling_serializes_starts() {
        let mut cfg = config();
        cfg.max_start_stop = 1;
        let mut harness = Harness::new(cfg);
        harness.power_on();

        harness.send(2.0, vec![open("a", 10.0), open("b", 10.0)]);
        assert_eq!(harness.pu().in_transit(), 1);
        harness.advance(10.0);

        let opens: Vec<(SimTime, PuAck)> = harness
            .acks()
            .into_iter()
            .filter(|(_, a)| matches!(a, PuAck::Open { .. }))
            .collect();
        assert_eq!(
            opens,
            vec![
                (2.5, PuAck::Open { key: key("a"), accepted: true }),
                (3.0, PuAck::Open { key: key("b"), accepted: true }),
            ]
        );
    }

    #[test]
    fn test_close_rejected_during_ongoing_check() {
        let mut harness = Harness::new(config());
        harness.power_on();
        harness.send(2.0, vec![open("a", 10.0)]);
        harness.advance(3.0);

        harness.send(
            3.0,
            vec![PuCommand::OngoingSession { key: key("a"), request_id: 9 }],
        );
        harness.send(3.125, vec![close("a")]);
        assert_eq!(
            harness.acks().last().unwrap(),
            &(3.125, PuAck::Close { key: key("a"), accepted: false })
        );

        harness.advance(3.25);
        assert_eq!(
            harness.acks().last().unwrap(),
            &(3.25, PuAck::Ongoing { key: key("a"), request_id: 9, accepted: true })
        );
        assert!(harness.pu().report().contains(&key("a")));

        harness.send(4.0, vec![close("a")]);
        harness.advance(10.0);
        assert_eq!(
            harness.acks().last().unwrap(),
            &(4.5, PuAck::Close { key: key("a"), accepted: true })
        );
        assert!(!harness.pu().report().contains(&key("a")));
        assert_eq!(harness.pu().utilization(), 0.0);
    }

    #[test]
    fn test_duplicate_close_is_ignored() {
        let mut harness = Harness::new(config());
        harness.power_on();
        harness.send(2.0, vec![open("a", 10.0)]);
        harness.advance(3.0);

        harness.send(3.0, vec![close("a")]);
        harness.send(3.25, vec![close("a")]);
        harness.advance(10.0);

        let closes = harness
            .acks()
            .into_iter()
            .filter(|(_, a)| matches!(a, PuAck::Close { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_stopping_session_still_counts() {
        let mut harness = Harness::new(config());
        harness.power_on();
        harness.send(2.0, vec![open("a", 70.0)]);
        harness.advance(3.0);

        harness.send(3.0, vec![close("a"), open("b", 50.0)]);
        assert_eq!(
            harness.acks().last().unwrap(),
            &(3.0, PuAck::Open { key: key("b"), accepted: false })
        );
        assert_eq!(harness.pu().utilization(), 70.0);
    }

    #[test]
    fn test_close_cancels_pending_start() {
        let mut harness = Harness::new(config());
        harness.power_on();

        harness.send(2.0, vec![open("a", 10.0)]);
        harness.send(2.25, vec![close("a")]);
        harness.advance(10.0);

        let acks: Vec<PuAck> = harness.acks().into_iter().map(|(_, a)| a).collect();
        assert!(acks.contains(&PuAck::Open { key: key("a"), accepted: false }));
        assert!(acks.contains(&PuAck::Close { key: key("a"), accepted: true }));
        assert!(!acks.contains(&PuAck::Open { key: key("a"), accepted: true }));
        assert_eq!(harness.pu().utilization(), 0.0);
        assert_eq!(harness.pu().phase(), PuPhase::On);
    }

    #[test]
    fn test_power_off_rules() {
        let mut harness = Harness::new(config());
        harness.power_on();
        harness.send(2.0, vec![open("a", 10.0)]);
        harness.advance(3.0);

        harness.send(3.0, vec![PuCommand::ChangeStatus(false)]);
        assert_eq!(harness.acks().last().unwrap(), &(3.0, PuAck::Status(false)));

        harness.send(3.0, vec![close("a")]);
        harness.advance(4.0);
        harness.send(4.0, vec![PuCommand::ChangeStatus(false)]);
        assert_eq!(harness.acks().last().unwrap(), &(4.0, PuAck::Status(true)));
        assert_eq!(harness.pu().phase(), PuPhase::ToOff);
        assert!(!harness.pu().report().status);

        harness.advance(5.0);
        assert_eq!(harness.pu().phase(), PuPhase::Off);
    }

    #[test]
    fn test_commands_deferred_during_power_on() {
        let mut harness = Harness::new(config());
        harness.send(0.0, vec![PuCommand::ChangeStatus(true), open("a", 20.0)]);
        assert_eq!(harness.acks(), vec![(0.0, PuAck::Status(true))]);

        harness.advance(10.0);
        assert_eq!(
            harness.acks().last().unwrap(),
            &(1.5, PuAck::Open { key: key("a"), accepted: true })
        );
    }

    #[test]
    fn test_dvfs_index_selection() {
        let mut cfg = config();
        let mut table = DvfsTable::new();
        for (index, frequency) in [(25, 0.4), (50, 0.6), (75, 0.8), (100, 1.0)] {
            table.insert(index, DvfsPoint { frequency });
        }
        cfg.dvfs_table = table;
        let mut harness = Harness::new(cfg);

        // applied while off, without touching the index
        harness.send(0.0, vec![PuCommand::SetDvfsMode(true)]);
        assert_eq!(harness.acks().last().unwrap(), &(0.0, PuAck::Dvfs(true)));
        let report = harness.reports().pop().unwrap();
        assert!(report.dvfs_mode);
        assert_eq!(report.dvfs_index, 0);

        harness.send(0.5, vec![PuCommand::ChangeStatus(true)]);
        harness.advance(1.5);
        assert_eq!(harness.pu().report().dvfs_index, 25);

        harness.send(2.0, vec![open("a", 40.0)]);
        harness.advance(10.0);
        assert_eq!(harness.pu().report().dvfs_index, 50);

        harness.send(10.0, vec![PuCommand::SetDvfsMode(false)]);
        assert_eq!(harness.pu().report().dvfs_index, FULL_SPEED_DVFS_INDEX);
    }

    #[test]
    fn test_unchanged_dvfs_mode_emits_no_report() {
        let mut harness = Harness::new(config());
        let before = harness.reports().len();
        harness.send(1.0, vec![PuCommand::SetDvfsMode(false)]);
        assert_eq!(harness.reports().len(), before);
    }

    #[test]
    fn test_power_model_refresh() {
        let mut cfg = config();
        cfg.power_model = Some(PowerModelConfig::Linear {
            idle_power: 50.0,
            max_power: 150.0,
        });
        let mut harness = Harness::new(cfg);
        assert_eq!(harness.pu().report().power, 0.0);

        harness.power_on();
        assert_eq!(harness.pu().report().power, 50.0);

        harness.send(2.0, vec![open("a", 50.0)]);
        harness.advance(10.0);
        assert_eq!(harness.pu().report().power, 100.0);
        assert_eq!(harness.pu().report().temperature, 25.0);
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let mut cfg = config();
        cfg.dvfs_table.clear();
        assert!(ProcessingUnit::new(0, cfg).is_err());
    }
}
