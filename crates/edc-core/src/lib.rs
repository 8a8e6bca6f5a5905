//! # edc-core
//!
//! Core types, traits, and configuration for the edge data center simulator.
//!
//! This crate provides the vocabulary shared by every simulation model:
//!
//! - Session identities and the request/response messages of the session layer
//! - Processing unit and rack reports
//! - Configuration schema and validation
//! - Capability traits for dispatching policies and power/temperature models
//! - Error handling types

pub mod config;
pub mod error;
pub mod state;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{
    DvfsPoint, DvfsTable, EdcConfig, ManagerConfig, PowerModelConfig, PuConfig, RackConfig,
    StrategyType, TemperatureModelConfig, FULL_SPEED_DVFS_INDEX,
};
pub use error::{Error, ErrorContext, Result};
pub use state::{OngoingSessions, PuReport, RackReport};
pub use traits::{DispatchStrategy, PowerContext, PowerModel, TemperatureModel};
pub use types::{PuIndex, RackId, RequestId, SessionKey, SessionRequest, SessionResponse};
