//! Rack resource manager.
//!
//! The manager admits session requests, picks a PU through its dispatching
//! strategy and drives every PU with at most one command in flight. It keeps
//! two views of each PU: the last report the PU actually sent, and a mirror
//! that already reflects every command queued or in flight. Placement and
//! power decisions are always taken against the mirror.
//!
//! The one-command limit covers the blocking kinds (status, DVFS, open,
//! close). Liveness checks are sent whenever the session is open, alongside a
//! blocking command if one is in flight; a close for that session waits until
//! the check is answered.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use edc_core::{
    DispatchStrategy, Error, ManagerConfig, PuConfig, PuIndex, PuReport, RackId, RackReport,
    RequestId, Result, SessionKey, SessionRequest, SessionResponse,
};
use tracing::{debug, error, warn};

use crate::dispatch::StrategyFactory;
use crate::engine::{Atomic, SimTime, INFINITY};
use crate::pu::{PuAck, PuCommand, PuOutput};

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerInput {
    Request(SessionRequest),
    Pu { index: PuIndex, output: PuOutput },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerOutput {
    Response(SessionResponse),
    Command { index: PuIndex, command: PuCommand },
    Report(RackReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Idle,
}

/// Where a session stands from the manager's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Open command queued, not sent
    Pending,
    /// Open command in flight
    Opening,
    Open,
    /// Close command queued or in flight
    Closing,
}

#[derive(Debug, Clone)]
struct MirrorSession {
    cost: f64,
    phase: SessionPhase,
}

/// Speculative state of one PU
#[derive(Debug, Clone, Default)]
struct Mirror {
    status: bool,
    dvfs_mode: bool,
    sessions: BTreeMap<SessionKey, MirrorSession>,
    checks: BTreeSet<(SessionKey, RequestId)>,
}

impl Mirror {
    fn utilization(&self) -> f64 {
        self.sessions.values().map(|s| s.cost).sum()
    }

    fn checking(&self, key: &SessionKey) -> bool {
        self.checks.iter().any(|(k, _)| k == key)
    }
}

/// Commands waiting for the PU to become unblocked
#[derive(Debug, Clone, Default)]
struct CommandQueue {
    set_dvfs: Option<bool>,
    change_status: Option<bool>,
    closes: VecDeque<SessionKey>,
    opens: VecDeque<SessionKey>,
}

/// Blocking command currently awaiting acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
enum InFlight {
    Status(bool),
    Dvfs(bool),
    Open(SessionKey),
    Close(SessionKey),
}

pub struct ResourceManager {
    rack_id: RackId,
    config: ManagerConfig,
    strategy: Box<dyn DispatchStrategy>,
    phase: Phase,

    reports: Vec<PuReport>,
    mirrors: Vec<Mirror>,
    queues: Vec<CommandQueue>,
    in_flight: Vec<Option<InFlight>>,
    owners: BTreeMap<SessionKey, PuIndex>,

    outbox: Vec<ManagerOutput>,
}

impl ResourceManager {
    /// Manager for the given PUs, driven by an arbitrary strategy
    pub fn new(
        rack_id: RackId,
        config: ManagerConfig,
        strategy: Box<dyn DispatchStrategy>,
        pus: &[PuConfig],
    ) -> Result<Self> {
        if pus.is_empty() {
            return Err(Error::config(format!("Rack {} manages no PUs", rack_id)));
        }

        let reports: Vec<PuReport> = pus
            .iter()
            .map(|pu| PuReport::off(pu.max_u, pu.ambient_temperature))
            .collect();
        let n = reports.len();

        Ok(Self {
            rack_id,
            config,
            strategy,
            phase: Phase::Init,
            reports,
            mirrors: vec![Mirror::default(); n],
            queues: vec![CommandQueue::default(); n],
            in_flight: vec![None; n],
            owners: BTreeMap::new(),
            outbox: Vec::new(),
        })
    }

    /// Manager using the built-in strategy named in its configuration
    pub fn from_config(rack_id: RackId, config: ManagerConfig, pus: &[PuConfig]) -> Result<Self> {
        let strategy = StrategyFactory::create_strategy(config.strategy);
        Self::new(rack_id, config, strategy, pus)
    }

    pub fn rack_id(&self) -> &RackId {
        &self.rack_id
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn pu_count(&self) -> usize {
        self.reports.len()
    }

    /// Last reports received from the PUs
    pub fn reports(&self) -> &[PuReport] {
        &self.reports
    }

    pub fn is_blocked(&self, index: PuIndex) -> bool {
        self.in_flight.get(index).map_or(false, Option::is_some)
    }

    /// PU currently holding (or about to hold) a session
    pub fn owner(&self, key: &SessionKey) -> Option<PuIndex> {
        self.owners.get(key).copied()
    }

    pub fn session_phase(&self, key: &SessionKey) -> Option<SessionPhase> {
        let index = self.owner(key)?;
        self.mirrors[index].sessions.get(key).map(|s| s.phase)
    }

    /// Speculative utilization of a PU
    pub fn mirror_utilization(&self, index: PuIndex) -> f64 {
        self.mirrors.get(index).map_or(0.0, Mirror::utilization)
    }

    /// Mirror of every PU, expressed as reports for the strategy
    fn views(&self) -> Vec<PuReport> {
        self.reports
            .iter()
            .zip(&self.mirrors)
            .map(|(report, mirror)| {
                let mut view = report.clone();
                view.status = mirror.status;
                view.dvfs_mode = mirror.dvfs_mode;
                view.utilization = mirror.utilization();
                view.ongoing_sessions.clear();
                for key in mirror.sessions.keys() {
                    view.ongoing_sessions
                        .entry(key.service_id.clone())
                        .or_default()
                        .insert(key.session_id.clone());
                }
                view
            })
            .collect()
    }

    fn respond(&mut self, response: SessionResponse) {
        self.outbox.push(ManagerOutput::Response(response));
    }

    fn command(&mut self, index: PuIndex, command: PuCommand) {
        debug!(rack = %self.rack_id, pu = index, command = command.kind(), "sending command");
        self.outbox.push(ManagerOutput::Command { index, command });
    }

    fn desync(&self, index: PuIndex, detail: String) -> Error {
        error!(rack = %self.rack_id, pu = index, "{}", detail);
        Error::desync(format!("rack {} PU {}: {}", self.rack_id, index, detail))
    }

    fn emit_report(&mut self) {
        let report = RackReport::new(self.rack_id.clone(), self.reports.clone());
        self.outbox.push(ManagerOutput::Report(report));
    }

    /// Clear the in-flight command of a PU, checking it matches the acknowledgment
    fn unblock(&mut self, index: PuIndex, ack: &PuAck) -> Result<()> {
        let matches = match (&self.in_flight[index], ack) {
            (Some(InFlight::Status(_)), PuAck::Status(_)) => true,
            (Some(InFlight::Dvfs(_)), PuAck::Dvfs(_)) => true,
            (Some(InFlight::Open(sent)), PuAck::Open { key, .. }) => sent == key,
            (Some(InFlight::Close(sent)), PuAck::Close { key, .. }) => sent == key,
            _ => false,
        };
        if !matches {
            let detail = format!("acknowledgment {:?} while {:?} in flight", ack, self.in_flight[index]);
            return Err(self.desync(index, detail));
        }
        self.in_flight[index] = None;
        Ok(())
    }

    fn handle_ack(&mut self, index: PuIndex, ack: PuAck) -> Result<()> {
        if let PuAck::Ongoing { key, request_id, accepted } = ack {
            let check = (key, request_id);
            if !self.mirrors[index].checks.remove(&check) {
                return Err(self.desync(index, format!("unexpected liveness answer for {}", check.0)));
            }
            let (key, request_id) = check;
            self.respond(SessionResponse::OngoingSession { key, request_id, accepted });
            return Ok(());
        }

        if !ack.accepted() {
            return Err(self.desync(index, format!("command rejected by PU: {:?}", ack)));
        }
        self.unblock(index, &ack)?;

        match ack {
            PuAck::Open { key, .. } => {
                if let Some(session) = self.mirrors[index].sessions.get_mut(&key) {
                    if session.phase == SessionPhase::Opening {
                        session.phase = SessionPhase::Open;
                    }
                }
                self.respond(SessionResponse::CreateSession { key, accepted: true });
            }
            PuAck::Close { key, .. } => {
                self.mirrors[index].sessions.remove(&key);
                self.owners.remove(&key);
                self.respond(SessionResponse::RemoveSession { key, accepted: true });
            }
            PuAck::Status(_) | PuAck::Dvfs(_) | PuAck::Ongoing { .. } => {}
        }
        Ok(())
    }

    fn handle_remove(&mut self, key: SessionKey) {
        let Some(index) = self.owner(&key) else {
            self.respond(SessionResponse::RemoveSession { key, accepted: true });
            return;
        };

        let phase = self.mirrors[index].sessions.get(&key).map(|s| s.phase);
        match phase {
            Some(SessionPhase::Pending) => {
                // Never reached the PU: cancel in place
                self.queues[index].opens.retain(|k| k != &key);
                self.mirrors[index].sessions.remove(&key);
                self.owners.remove(&key);
                self.respond(SessionResponse::CreateSession { key: key.clone(), accepted: false });
                self.respond(SessionResponse::RemoveSession { key, accepted: true });
            }
            Some(SessionPhase::Opening) | Some(SessionPhase::Open) => {
                if let Some(session) = self.mirrors[index].sessions.get_mut(&key) {
                    session.phase = SessionPhase::Closing;
                }
                self.queues[index].closes.push_back(key);
            }
            Some(SessionPhase::Closing) => {
                debug!(rack = %self.rack_id, session = %key, "session already closing");
            }
            None => {
                self.owners.remove(&key);
                self.respond(SessionResponse::RemoveSession { key, accepted: true });
            }
        }
    }

    fn handle_create(&mut self, key: SessionKey, cost: f64) {
        if !cost.is_finite() || cost < 0.0 {
            warn!(rack = %self.rack_id, session = %key, cost, "invalid session cost");
            self.respond(SessionResponse::CreateSession { key, accepted: false });
            return;
        }

        if let Some(phase) = self.session_phase(&key) {
            let accepted = phase != SessionPhase::Closing;
            self.respond(SessionResponse::CreateSession { key, accepted });
            return;
        }

        let views = self.views();
        match self.strategy.place(cost, &views) {
            Some(index) if index < self.mirrors.len() => {
                debug!(rack = %self.rack_id, session = %key, pu = index, cost, "session placed");
                self.mirrors[index].sessions.insert(
                    key.clone(),
                    MirrorSession {
                        cost,
                        phase: SessionPhase::Pending,
                    },
                );
                self.owners.insert(key.clone(), index);
                self.queues[index].opens.push_back(key);
            }
            Some(index) => {
                warn!(rack = %self.rack_id, pu = index, "strategy chose a PU outside the rack");
                self.respond(SessionResponse::CreateSession { key, accepted: false });
            }
            None => {
                warn!(rack = %self.rack_id, session = %key, cost, "no PU can host session");
                self.respond(SessionResponse::CreateSession { key, accepted: false });
            }
        }
    }

    fn handle_ongoing(&mut self, key: SessionKey, request_id: RequestId) {
        let target = self
            .owner(&key)
            .filter(|index| self.mirrors[*index].sessions.get(&key).map(|s| s.phase) == Some(SessionPhase::Open));

        let check = (key, request_id);
        match target {
            Some(index) if !self.mirrors[index].checks.contains(&check) => {
                self.mirrors[index].checks.insert(check.clone());
                let (key, request_id) = check;
                self.command(index, PuCommand::OngoingSession { key, request_id });
            }
            _ => {
                let (key, request_id) = check;
                self.respond(SessionResponse::OngoingSession {
                    key,
                    request_id,
                    accepted: false,
                });
            }
        }
    }

    /// Compare policy targets against the mirror and queue what differs
    fn apply_policy(&mut self) {
        let views = self.views();
        let status = self.strategy.power_policy(&views, self.config.hw_power_off);
        let dvfs = self.strategy.dvfs_policy(&views, self.config.hw_dvfs_mode);

        for (index, target) in status.into_iter().enumerate().take(self.mirrors.len()) {
            if self.mirrors[index].status != target {
                self.mirrors[index].status = target;
                self.queues[index].change_status = Some(target);
            }
        }
        for (index, target) in dvfs.into_iter().enumerate().take(self.mirrors.len()) {
            if self.mirrors[index].dvfs_mode != target {
                self.mirrors[index].dvfs_mode = target;
                self.queues[index].set_dvfs = Some(target);
            }
        }
    }

    /// Send one queued command to every unblocked PU
    fn schedule(&mut self) {
        for index in 0..self.queues.len() {
            if self.in_flight[index].is_some() {
                continue;
            }

            let queue = &mut self.queues[index];
            let mirror = &self.mirrors[index];
            let next = if let Some(mode) = queue.set_dvfs.take() {
                Some((InFlight::Dvfs(mode), PuCommand::SetDvfsMode(mode)))
            } else if let Some(status) = queue.change_status.take() {
                Some((InFlight::Status(status), PuCommand::ChangeStatus(status)))
            } else if let Some(position) = queue.closes.iter().position(|k| !mirror.checking(k)) {
                queue.closes.remove(position).map(|key| {
                    (InFlight::Close(key.clone()), PuCommand::CloseSession { key })
                })
            } else {
                queue.opens.pop_front().map(|key| {
                    let cost = mirror.sessions.get(&key).map_or(0.0, |s| s.cost);
                    (InFlight::Open(key.clone()), PuCommand::OpenSession { key, cost })
                })
            };

            if let Some((flight, command)) = next {
                if let InFlight::Open(key) = &flight {
                    if let Some(session) = self.mirrors[index].sessions.get_mut(key) {
                        session.phase = SessionPhase::Opening;
                    }
                }
                self.in_flight[index] = Some(flight);
                self.command(index, command);
            }
        }
    }

    fn process(&mut self, inputs: Vec<ManagerInput>) -> Result<()> {
        let mut acks = Vec::new();
        let mut removes = Vec::new();
        let mut creates = Vec::new();
        let mut ongoing = Vec::new();
        let mut reports_changed = false;

        for input in inputs {
            match input {
                ManagerInput::Pu { index, output } => {
                    if index >= self.reports.len() {
                        return Err(Error::routing(format!("rack {} has no PU {}", self.rack_id, index)));
                    }
                    match output {
                        PuOutput::Report(report) => {
                            if self.reports[index] != report {
                                self.reports[index] = report;
                                reports_changed = true;
                            }
                        }
                        PuOutput::Ack(ack) => acks.push((index, ack)),
                    }
                }
                ManagerInput::Request(SessionRequest::RemoveSession { key }) => removes.push(key),
                ManagerInput::Request(SessionRequest::CreateSession { key, cost }) => creates.push((key, cost)),
                ManagerInput::Request(SessionRequest::OngoingSession { key, request_id }) => {
                    ongoing.push((key, request_id))
                }
            }
        }

        for (index, ack) in acks {
            self.handle_ack(index, ack)?;
        }
        for key in removes {
            self.handle_remove(key);
        }
        for (key, cost) in creates {
            self.handle_create(key, cost);
        }
        for (key, request_id) in ongoing {
            self.handle_ongoing(key, request_id);
        }

        self.apply_policy();
        self.schedule();

        if reports_changed {
            self.emit_report();
        }
        Ok(())
    }
}

impl Atomic for ResourceManager {
    type Input = ManagerInput;
    type Output = ManagerOutput;

    fn initialize(&mut self) {
        self.phase = Phase::Init;
        self.outbox.clear();
        self.emit_report();
        self.apply_policy();
        self.schedule();
    }

    fn time_advance(&self) -> SimTime {
        if self.outbox.is_empty() {
            INFINITY
        } else {
            0.0
        }
    }

    fn output(&self) -> Vec<ManagerOutput> {
        self.outbox.clone()
    }

    fn internal_transition(&mut self) -> Result<()> {
        self.outbox.clear();
        if self.phase == Phase::Init {
            debug!(rack = %self.rack_id, strategy = self.strategy.name(), "resource manager ready");
            self.phase = Phase::Idle;
        }
        Ok(())
    }

    fn external_transition(&mut self, _elapsed: SimTime, inputs: Vec<ManagerInput>) -> Result<()> {
        self.process(inputs)
    }
}
