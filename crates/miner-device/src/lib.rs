#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(unreachable_pub)]

//! Compute-device contract for `hds-miner`, plus a scripted device used for
//! dry runs and tests.

/// Device traits and completion signalling.
pub mod api;

/// Timed fake devices.
pub mod scripted;

pub use api::{
    completion_pair, Completion, CompletionSignal, ComputeDevice, DeviceError, DeviceInfo,
    DevicePlatform, KernelInput, KernelSlot,
};
pub use scripted::{ScriptedDevice, ScriptedPlatform};
