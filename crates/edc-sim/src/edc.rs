//! Edge data center: independent racks behind a rack-id multiplexer.

use edc_core::{EdcConfig, RackConfig, RackId, Result, SessionRequest, StrategyType};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{align, Atomic, SimTime, Simulator, INFINITY};
use crate::mux::Multiplexer;
use crate::rack::{Rack, RackOutput};

/// A session request addressed to one rack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdcInput {
    pub rack_id: RackId,
    pub request: SessionRequest,
}

impl EdcInput {
    pub fn new(rack_id: RackId, request: SessionRequest) -> Self {
        Self { rack_id, request }
    }
}

/// A rack output tagged with its source
#[derive(Debug, Clone, PartialEq)]
pub struct EdcOutput {
    pub rack_id: RackId,
    pub output: RackOutput,
}

pub struct Edc {
    id: String,
    mux: Multiplexer<RackId>,
    racks: Vec<Simulator<Rack>>,
    clock: SimTime,
    carry: Vec<EdcOutput>,
}

impl Edc {
    pub fn new(config: &EdcConfig) -> Result<Self> {
        config.validate()?;
        let racks = config
            .racks
            .iter()
            .map(|rack| Rack::new(rack).map(Simulator::new))
            .collect::<Result<Vec<_>>>()?;
        let mux = Multiplexer::new(config.racks.iter().map(|rack| rack.id.clone()))?;

        info!(
            edc = %config.id,
            racks = racks.len(),
            pus = config.total_pus(),
            "edge data center assembled"
        );

        Ok(Self {
            id: config.id.clone(),
            mux,
            racks,
            clock: 0.0,
            carry: Vec::new(),
        })
    }

    /// Same topology with every rack driven by `strategy`
    pub fn with_strategy(config: &EdcConfig, strategy: StrategyType) -> Result<Self> {
        let mut config = config.clone();
        for rack in &mut config.racks {
            rack.manager.strategy = strategy;
        }
        Self::new(&config)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rack(&self, rack_id: &RackId) -> Option<&Rack> {
        let channel = self.mux.route(rack_id).ok()?;
        self.racks.get(channel).map(Simulator::model)
    }

    pub fn racks(&self) -> impl Iterator<Item = &Rack> {
        self.racks.iter().map(Simulator::model)
    }

    fn children_next(&self) -> SimTime {
        self.racks.iter().map(Simulator::next_time).fold(INFINITY, f64::min)
    }

    fn next_time(&self) -> SimTime {
        if self.carry.is_empty() {
            self.children_next()
        } else {
            self.clock
        }
    }

    fn collect(&self, t: SimTime) -> Vec<EdcOutput> {
        let per_rack = self.racks.iter().map(|rack| rack.collect(t)).collect();
        self.mux
            .fan_in(per_rack)
            .into_iter()
            .map(|(rack_id, output)| EdcOutput { rack_id, output })
            .collect()
    }

    fn step(&mut self, t: SimTime, inputs: Vec<EdcInput>, announced: bool) -> Result<()> {
        if announced {
            self.carry.clear();
        } else {
            let missed = self.collect(t);
            self.carry.extend(missed);
        }

        let bags = self
            .mux
            .demux(inputs.into_iter().map(|input| (input.rack_id, input.request)))?;
        for (rack, bag) in self.racks.iter_mut().zip(bags) {
            rack.transition(t, bag)?;
        }
        self.clock = t;
        Ok(())
    }
}

impl Atomic for Edc {
    type Input = EdcInput;
    type Output = EdcOutput;

    fn initialize(&mut self) {
        self.clock = 0.0;
        self.carry.clear();
        for rack in &mut self.racks {
            rack.initialize(0.0);
        }
    }

    fn finalize(&mut self) {
        for rack in &mut self.racks {
            rack.finalize();
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

    fn output(&self) -> Vec<EdcOutput> {
        let mut outputs = self.carry.clone();
        outputs.extend(self.collect(self.next_time()));
        outputs
    }

    fn internal_transition(&mut self) -> Result<()> {
        let t = self.next_time();
        self.step(t, Vec::new(), true)
    }

    fn external_transition(&mut self, elapsed: SimTime, inputs: Vec<EdcInput>) -> Result<()> {
        let t = align(self.clock + elapsed, self.children_next());
        self.step(t, inputs, false)
    }

    fn confluent_transition(&mut self, inputs: Vec<EdcInput>) -> Result<()> {
        let t = self.next_time();
        self.step(t, inputs, true)
    }
}

/// Configuration of a single rack wrapped in a data center
pub fn single_rack(rack: RackConfig) -> EdcConfig {
    EdcConfig {
        id: format!("edc-{}", rack.id),
        racks: vec![rack],
    }
}
