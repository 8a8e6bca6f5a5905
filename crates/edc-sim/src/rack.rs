//! Rack: a resource manager coupled with its processing units.
//!
//! Session requests enter through the manager. Manager commands are routed to
//! the addressed PU; every PU output flows back into the manager. Within one
//! instant the manager transitions first, then the PUs by index.

use edc_core::{
    DispatchStrategy, PuIndex, RackConfig, RackId, RackReport, Result, SessionRequest, SessionResponse,
};

use crate::engine::{align, Atomic, SimTime, Simulator, INFINITY};
use crate::manager::{ManagerInput, ManagerOutput, ResourceManager};
use crate::mux::Multiplexer;
use crate::pu::{ProcessingUnit, PuOutput};

/// Messages leaving a rack
#[derive(Debug, Clone, PartialEq)]
pub enum RackOutput {
    Response(SessionResponse),
    Report(RackReport),
}

pub struct Rack {
    id: RackId,
    manager: Simulator<ResourceManager>,
    mux: Multiplexer<PuIndex>,
    pus: Vec<Simulator<ProcessingUnit>>,
    clock: SimTime,
    /// External outputs produced outside of an announced transition
    carry: Vec<RackOutput>,
}

impl Rack {
    /// Build a rack using the strategy named in its configuration
    pub fn new(config: &RackConfig) -> Result<Self> {
        config.validate()?;
        let manager = ResourceManager::from_config(config.id.clone(), config.manager.clone(), &config.pus)?;
        Self::assemble(config, manager)
    }

    /// Build a rack driven by an externally supplied strategy
    pub fn with_strategy(config: &RackConfig, strategy: Box<dyn DispatchStrategy>) -> Result<Self> {
        config.validate()?;
        let manager =
            ResourceManager::new(config.id.clone(), config.manager.clone(), strategy, &config.pus)?;
        Self::assemble(config, manager)
    }

    fn assemble(config: &RackConfig, manager: ResourceManager) -> Result<Self> {
        let pus = config
            .pus
            .iter()
            .enumerate()
            .map(|(index, pu)| ProcessingUnit::new(index, pu.clone()).map(Simulator::new))
            .collect::<Result<Vec<_>>>()?;
        let mux = Multiplexer::new(0..pus.len())?;

        Ok(Self {
            id: config.id.clone(),
            manager: Simulator::new(manager),
            mux,
            pus,
            clock: 0.0,
            carry: Vec::new(),
        })
    }

    pub fn id(&self) -> &RackId {
        &self.id
    }

    pub fn manager(&self) -> &ResourceManager {
        self.manager.model()
    }

    pub fn pu(&self, index: PuIndex) -> Option<&ProcessingUnit> {
        self.pus.get(index).map(Simulator::model)
    }

    pub fn pu_count(&self) -> usize {
        self.pus.len()
    }

    fn children_next(&self) -> SimTime {
        self.pus
            .iter()
            .map(Simulator::next_time)
            .fold(self.manager.next_time(), f64::min)
    }

    fn next_time(&self) -> SimTime {
        if self.carry.is_empty() {
            self.children_next()
        } else {
            self.clock
        }
    }

    fn external(outputs: Vec<ManagerOutput>) -> Vec<RackOutput> {
        outputs
            .into_iter()
            .filter_map(|output| match output {
                ManagerOutput::Response(response) => Some(RackOutput::Response(response)),
                ManagerOutput::Report(report) => Some(RackOutput::Report(report)),
                ManagerOutput::Command { .. } => None,
            })
            .collect()
    }

    /// Route the outputs of children imminent at `t`, then transition every child.
    ///
    /// `announced` tells whether the parent already collected this rack's
    /// outputs for `t`.
    fn step(&mut self, t: SimTime, requests: Vec<SessionRequest>, announced: bool) -> Result<()> {
        if announced {
            self.carry.clear();
        }

        let manager_outputs = self.manager.collect(t);
        let pu_outputs: Vec<Vec<PuOutput>> = self.pus.iter().map(|pu| pu.collect(t)).collect();

        let mut commands = Vec::new();
        for output in manager_outputs {
            match output {
                ManagerOutput::Command { index, command } => commands.push((index, command)),
                ManagerOutput::Response(response) if !announced => {
                    self.carry.push(RackOutput::Response(response))
                }
                ManagerOutput::Report(report) if !announced => self.carry.push(RackOutput::Report(report)),
                _ => {}
            }
        }
        let bags = self.mux.demux(commands)?;

        let mut inputs: Vec<ManagerInput> = self
            .mux
            .fan_in(pu_outputs)
            .into_iter()
            .map(|(index, output)| ManagerInput::Pu { index, output })
            .collect();
        inputs.extend(requests.into_iter().map(ManagerInput::Request));

        self.manager.transition(t, inputs)?;
        for (pu, bag) in self.pus.iter_mut().zip(bags) {
            pu.transition(t, bag)?;
        }
        self.clock = t;
        Ok(())
    }
}

impl Atomic for Rack {
    type Input = SessionRequest;
    type Output = RackOutput;

    fn initialize(&mut self) {
        self.clock = 0.0;
        self.carry.clear();
        self.manager.initialize(0.0);
        for pu in &mut self.pus {
            pu.initialize(0.0);
        }
    }

    fn finalize(&mut self) {
        self.manager.finalize();
        for pu in &mut self.pus {
            pu.finalize();
        }
    }

    fn time_advance(&self) -> SimTime {
        let next = self.next_time();
        if next == INFINITY {
            INFINITY
        } else {
            next - self.clock
        }
    }

    fn output(&self) -> Vec<RackOutput> {
        let t = self.next_time();
        let mut outputs = self.carry.clone();
        outputs.extend(Self::external(self.manager.collect(t)));
        outputs
    }

    fn internal_transition(&mut self) -> Result<()> {
        let t = self.next_time();
        self.step(t, Vec::new(), true)
    }

    fn external_transition(&mut self, elapsed: SimTime, inputs: Vec<SessionRequest>) -> Result<()> {
        let t = align(self.clock + elapsed, self.children_next());
        self.step(t, inputs, false)
    }

    fn confluent_transition(&mut self, inputs: Vec<SessionRequest>) -> Result<()> {
        let t = self.next_time();
        self.step(t, inputs, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pu::PuPhase;
    use edc_core::{ManagerConfig, PuConfig, SessionKey, StrategyType};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn pu_config() -> PuConfig {
        PuConfig {
            t_on: 1.0,
            t_off: 1.0,
            t_start: 0.5,
            t_stop: 0.5,
            t_operation: 0.25,
            ..PuConfig::default()
        }
    }

    fn rack_config(pus: usize, hw_power_off: bool) -> RackConfig {
        RackConfig {
            id: RackId::new("r0"),
            manager: ManagerConfig {
                strategy: StrategyType::EmptiestPu,
                hw_power_off,
                hw_dvfs_mode: false,
            },
            pus: vec![pu_config(); pus],
        }
    }

    fn key(session: &str) -> SessionKey {
        SessionKey::new("svc", session)
    }

    struct Harness {
        sim: Simulator<Rack>,
        log: Vec<(SimTime, RackOutput)>,
    }

    impl Harness {
        fn new(config: RackConfig) -> Self {
            let mut sim = Simulator::new(Rack::new(&config).unwrap());
            sim.initialize(0.0);
            let mut harness = Self { sim, log: Vec::new() };
            harness.advance(0.0);
            harness
        }

        fn fire(&mut self, t: SimTime, inputs: Vec<SessionRequest>) {
            for output in self.sim.collect(t) {
                self.log.push((t, output));
            }
            self.sim.transition(t, inputs).unwrap();
            self.check_invariants();
        }

        fn advance(&mut self, until: SimTime) {
            let mut events = 0;
            while self.sim.next_time() <= until {
                let t = self.sim.next_time();
                self.fire(t, vec![]);
                events += 1;
                assert!(events < 100_000, "rack never settles");
            }
        }

        fn send(&mut self, t: SimTime, requests: Vec<SessionRequest>) {
            while self.sim.next_time() < t {
                let next = self.sim.next_time();
                self.fire(next, vec![]);
            }
            self.fire(t, requests);
            self.advance(t);
        }

        fn rack(&self) -> &Rack {
            self.sim.model()
        }

        fn responses(&self) -> Vec<(SimTime, SessionResponse)> {
            self.log
                .iter()
                .filter_map(|(t, o)| match o {
                    RackOutput::Response(r) => Some((*t, r.clone())),
                    RackOutput::Report(_) => None,
                })
                .collect()
        }

        fn last_report(&self) -> RackReport {
            self.log
                .iter()
                .rev()
                .find_map(|(_, o)| match o {
                    RackOutput::Report(r) => Some(r.clone()),
                    RackOutput::Response(_) => None,
                })
                .unwrap()
        }

        /// Utilization bounds and session uniqueness hold at every instant
        fn check_invariants(&self) {
            let rack = self.rack();
            let mut seen = BTreeSet::new();
            for index in 0..rack.pu_count() {
                let report = rack.pu(index).unwrap().report();
                assert!(report.utilization >= 0.0);
                assert!(report.utilization <= report.max_u + 1e-9);
                for (service, sessions) in &report.ongoing_sessions {
                    for session in sessions {
                        assert!(seen.insert((service.clone(), session.clone())), "session on two PUs");
                    }
                }
            }
        }
    }

    #[test]
    fn test_create_on_powered_pu() {
        let mut harness = Harness::new(rack_config(1, false));
        harness.advance(1.0);
        assert_eq!(harness.rack().pu(0).unwrap().phase(), PuPhase::On);

        harness.send(2.0, vec![SessionRequest::create("svc", "a", 40.0)]);
        harness.advance(10.0);

        assert_eq!(
            harness.responses(),
            vec![(2.5, SessionResponse::CreateSession { key: key("a"), accepted: true })]
        );
        let pu = harness.rack().pu(0).unwrap();
        assert_eq!(pu.phase(), PuPhase::On);
        assert_eq!(pu.utilization(), 40.0);
        assert_eq!(harness.last_report().pus[0].utilization, 40.0);
    }

    #[test]
    fn test_create_powers_on_off_pu() {
        let mut harness = Harness::new(rack_config(1, true));
        assert_eq!(harness.rack().pu(0).unwrap().phase(), PuPhase::Off);

        harness.send(1.0, vec![SessionRequest::create("svc", "a", 40.0)]);
        assert_eq!(harness.rack().pu(0).unwrap().phase(), PuPhase::ToOn);
        harness.advance(10.0);

        assert_eq!(
            harness.responses(),
            vec![(2.5, SessionResponse::CreateSession { key: key("a"), accepted: true })]
        );
        assert_eq!(harness.rack().pu(0).unwrap().utilization(), 40.0);
    }

    #[test]
    fn test_emptiest_picks_lowest_index_on_tie() {
        let mut harness = Harness::new(rack_config(2, false));
        harness.advance(1.0);
        harness.send(2.0, vec![SessionRequest::create("svc", "a", 30.0)]);
        harness.advance(10.0);

        assert_eq!(harness.rack().manager().owner(&key("a")), Some(0));
        assert!(harness.rack().pu(0).unwrap().report().contains(&key("a")));
        assert!(!harness.rack().pu(1).unwrap().report().contains(&key("a")));
    }

    #[test]
    fn test_create_rejected_when_no_capacity() {
        let mut harness = Harness::new(rack_config(1, false));
        harness.advance(1.0);
        harness.send(2.0, vec![SessionRequest::create("svc", "a", 90.0)]);
        harness.advance(10.0);
        harness.send(10.0, vec![SessionRequest::create("svc", "b", 20.0)]);
        harness.advance(20.0);

        assert_eq!(
            harness.responses().last().unwrap(),
            &(10.0, SessionResponse::CreateSession { key: key("b"), accepted: false })
        );
        assert_eq!(harness.rack().pu(0).unwrap().utilization(), 90.0);
    }

    #[test]
    fn test_remove_waits_for_liveness_check() {
        let mut harness = Harness::new(rack_config(1, false));
        harness.advance(1.0);
        harness.send(2.0, vec![SessionRequest::create("svc", "a", 10.0)]);
        harness.advance(3.0);

        harness.send(3.0, vec![SessionRequest::ongoing("svc", "a", 1)]);
        harness.send(3.125, vec![SessionRequest::remove("svc", "a")]);
        assert!(harness.rack().pu(0).unwrap().report().contains(&key("a")));
        harness.advance(10.0);

        let responses = harness.responses();
        assert_eq!(
            responses[1..].to_vec(),
            vec![
                (3.25, SessionResponse::OngoingSession { key: key("a"), request_id: 1, accepted: true }),
                (3.75, SessionResponse::RemoveSession { key: key("a"), accepted: true }),
            ]
        );
        assert_eq!(harness.rack().pu(0).unwrap().utilization(), 0.0);
    }

    #[test]
    fn test_idle_pu_powered_off_and_revived() {
        let mut harness = Harness::new(rack_config(1, true));
        harness.send(1.0, vec![SessionRequest::create("svc", "a", 40.0)]);
        harness.advance(3.0);
        harness.send(3.0, vec![SessionRequest::remove("svc", "a")]);
        harness.advance(3.5);
        assert_eq!(harness.rack().pu(0).unwrap().phase(), PuPhase::ToOff);

        harness.advance(5.0);
        assert_eq!(harness.rack().pu(0).unwrap().phase(), PuPhase::Off);
        assert!(!harness.last_report().pus[0].status);

        harness.send(6.0, vec![SessionRequest::create("svc", "b", 20.0)]);
        assert_eq!(harness.rack().pu(0).unwrap().phase(), PuPhase::ToOn);
        harness.advance(10.0);

        assert_eq!(
            harness.responses().last().unwrap(),
            &(7.5, SessionResponse::CreateSession { key: key("b"), accepted: true })
        );
        assert_eq!(harness.rack().pu(0).unwrap().phase(), PuPhase::On);
    }

    #[test]
    fn test_remove_unknown_session_is_idempotent() {
        let mut harness = Harness::new(rack_config(1, false));
        harness.send(2.0, vec![SessionRequest::remove("svc", "ghost")]);
        harness.send(3.0, vec![SessionRequest::remove("svc", "ghost")]);
        assert_eq!(
            harness.responses(),
            vec![
                (2.0, SessionResponse::RemoveSession { key: key("ghost"), accepted: true }),
                (3.0, SessionResponse::RemoveSession { key: key("ghost"), accepted: true }),
            ]
        );
    }

    #[test]
    fn test_create_then_remove_before_dispatch() {
        let mut harness = Harness::new(rack_config(1, false));
        harness.advance(1.0);
        harness.send(
            2.0,
            vec![
                SessionRequest::create("svc", "a", 10.0),
                SessionRequest::create("svc", "b", 10.0),
            ],
        );
        harness.send(2.25, vec![SessionRequest::remove("svc", "b")]);
        harness.advance(10.0);

        let responses: Vec<SessionResponse> = harness.responses().into_iter().map(|(_, r)| r).collect();
        assert!(responses.contains(&SessionResponse::CreateSession { key: key("b"), accepted: false }));
        assert!(responses.contains(&SessionResponse::RemoveSession { key: key("b"), accepted: true }));
        for (_, output) in &harness.log {
            if let RackOutput::Report(report) = output {
                assert!(report.pus.iter().all(|pu| !pu.contains(&key("b"))));
            }
        }
    }

    #[test]
    fn test_random_traffic_keeps_invariants() {
        let mut harness = Harness::new(rack_config(3, true));
        let mut rng = SmallRng::seed_from_u64(7);
        let mut t = 0.0;
        for _ in 0..300 {
            t += rng.gen_range(1..8) as f64 * 0.125;
            let session = format!("s{}", rng.gen_range(0..20));
            let request = match rng.gen_range(0..3) {
                0 => SessionRequest::create("svc", &session, rng.gen_range(1..6) as f64 * 10.0),
                1 => SessionRequest::remove("svc", &session),
                _ => SessionRequest::ongoing("svc", &session, rng.gen()),
            };
            harness.send(t, vec![request]);
        }
        harness.advance(t + 100.0);

        let manager = harness.rack().manager();
        for index in 0..3 {
            assert!(!manager.is_blocked(index));
            let pu = harness.rack().pu(index).unwrap();
            assert!((pu.utilization() - manager.mirror_utilization(index)).abs() < 1e-9);
        }
    }
}
