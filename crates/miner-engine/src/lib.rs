#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process engine for `hds-miner` (pool session, device pipelines,
//! solution submission).

/// Public API for the engine crate.
pub mod api;

/// Pool session and protocol errors.
pub mod error;

mod connection;
mod engine;
mod pipeline;
mod protocol;
mod session;
mod solver;

pub use api::{
    start_engine, DeviceSnapshot, DeviceStage, EngineConfig, EngineEvent, EngineHandle,
    StatusSnapshot,
};
pub use error::{ProtocolError, SessionError};
