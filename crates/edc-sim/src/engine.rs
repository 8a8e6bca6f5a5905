//! Discrete-event model contract
//!
//! Every component of the data center is a timed state machine that declares
//! how long it wishes to stay dormant, emits outputs right before its internal
//! transitions, and reacts to bags of inputs delivered by its parent.
//! Coupled models implement the same contract, so they nest.

use edc_core::{Error, Result};

/// Simulated time in seconds
pub type SimTime = f64;

/// Time advance of a passive model
pub const INFINITY: SimTime = f64::INFINITY;

/// Relative slack under which two event times denote the same instant
pub const TIME_TOLERANCE: SimTime = 1e-12;

/// Snap `t` onto `target` when both denote the same instant.
///
/// Coupled models rebuild absolute times from elapsed durations, which can
/// drift from their children's event times by a rounding error.
pub fn align(t: SimTime, target: SimTime) -> SimTime {
    if target.is_finite() && (target - t).abs() <= TIME_TOLERANCE * target.abs().max(1.0) {
        target
    } else {
        t
    }
}

/// A timed state machine driven by the discrete-event engine
pub trait Atomic {
    type Input;
    type Output;

    /// Called once before the simulation starts
    fn initialize(&mut self) {}

    /// Called once after the simulation ends
    fn finalize(&mut self) {}

    /// Time the model wishes to remain dormant
    fn time_advance(&self) -> SimTime;

    /// Outputs emitted right before the next internal transition
    fn output(&self) -> Vec<Self::Output>;

    /// The declared time advance elapsed with no input
    fn internal_transition(&mut self) -> Result<()>;

    /// Inputs arrived `elapsed` seconds after the last transition
    fn external_transition(&mut self, elapsed: SimTime, inputs: Vec<Self::Input>) -> Result<()>;

    /// Inputs arrived exactly when the time advance elapsed
    fn confluent_transition(&mut self, inputs: Vec<Self::Input>) -> Result<()> {
        self.internal_transition()?;
        self.external_transition(0.0, inputs)
    }
}

/// Abstract simulator: keeps the event times of one model and picks which
/// transition to apply.
#[derive(Debug)]
pub struct Simulator<M: Atomic> {
    model: M,
    last: SimTime,
    next: SimTime,
}

impl<M: Atomic> Simulator<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            last: 0.0,
            next: INFINITY,
        }
    }

    /// Initialize the model at time `t`
    pub fn initialize(&mut self, t: SimTime) {
        self.model.initialize();
        self.last = t;
        self.next = t + self.model.time_advance();
    }

    /// Finalize the model
    pub fn finalize(&mut self) {
        self.model.finalize();
    }

    /// Time of the last transition
    pub fn last_time(&self) -> SimTime {
        self.last
    }

    /// Time of the next internal transition
    pub fn next_time(&self) -> SimTime {
        self.next
    }

    /// Whether the model's internal transition is due at `t`
    pub fn is_imminent(&self, t: SimTime) -> bool {
        self.next == t
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Outputs of the model if it is imminent at `t`
    pub fn collect(&self, t: SimTime) -> Vec<M::Output> {
        if self.is_imminent(t) {
            self.model.output()
        } else {
            Vec::new()
        }
    }

    /// Apply the transition due at `t` given the inputs delivered at `t`
    pub fn transition(&mut self, t: SimTime, inputs: Vec<M::Input>) -> Result<()> {
        if t < self.last || t > self.next {
            return Err(Error::internal(format!(
                "causality violation: transition at {} outside [{}, {}]",
                t, self.last, self.next
            )));
        }

        let imminent = self.is_imminent(t);
        match (imminent, inputs.is_empty()) {
            (false, true) => return Ok(()),
            (true, true) => self.model.internal_transition()?,
            (false, false) => self.model.external_transition(t - self.last, inputs)?,
            (true, false) => self.model.confluent_transition(inputs)?,
        }

        self.last = t;
        self.next = t + self.model.time_advance();
        Ok(())
    }
}
