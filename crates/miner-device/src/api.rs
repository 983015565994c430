//! Contract between the engine and a compute device.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use hds_miner_core::variant::SolverVariant;
use hds_miner_core::work::Nonce;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors reported by a compute device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Devices could not be listed.
    #[error("device enumeration failed: {0}")]
    Enumerate(String),

    /// Building the kernels for a variant failed.
    #[error("preparing {variant} failed: {message}")]
    Prepare {
        /// Variant being prepared.
        variant: SolverVariant,
        /// Device-specific detail.
        message: String,
    },

    /// Queuing a search round failed.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// A dispatched round finished with an error.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Reading results back failed.
    #[error("collect failed: {0}")]
    Collect(String),

    /// The slot was never returned by `prepare` on this device.
    #[error("unknown kernel slot {0:?}")]
    UnknownSlot(KernelSlot),

    /// The device dropped the completion signal without firing it.
    #[error("completion signal dropped")]
    CompletionDropped,
}

/// Static description of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Index as listed by the platform.
    pub index: usize,
    /// Human-readable name.
    pub name: String,
}

/// Handle to kernels prepared for one variant on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelSlot(pub usize);

/// Inputs of one search round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInput {
    /// Variant the slot was prepared for.
    pub variant: SolverVariant,
    /// Header (prehashed for variant III).
    pub header: [u8; 32],
    /// Nonce of this round.
    pub nonce: Nonce,
}

/// Device side of a completion: fired exactly once when a round ends.
#[derive(Debug)]
pub struct CompletionSignal(oneshot::Sender<Result<(), DeviceError>>);

impl CompletionSignal {
    /// Report the end of the round. Firing after the waiter is gone is a no-op.
    pub fn complete(self, result: Result<(), DeviceError>) {
        let _ = self.0.send(result);
    }
}

/// Pipeline side of a completion: resolves when the device fires the signal.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<Result<(), DeviceError>>);

impl Future for Completion {
    type Output = Result<(), DeviceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DeviceError::CompletionDropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a connected signal/future pair for one dispatch.
pub fn completion_pair() -> (CompletionSignal, Completion) {
    let (tx, rx) = oneshot::channel();
    (CompletionSignal(tx), Completion(rx))
}

/// A compute device able to run search rounds.
///
/// `prepare` may block; callers run it off the async executor. `dispatch`
/// must return without waiting for the round to finish.
pub trait ComputeDevice: Send {
    /// Device description.
    fn info(&self) -> &DeviceInfo;

    /// Build (or reuse) the kernels for `variant`.
    fn prepare(&mut self, variant: SolverVariant) -> Result<KernelSlot, DeviceError>;

    /// Start one search round on a prepared slot.
    fn dispatch(&mut self, slot: KernelSlot, input: &KernelInput) -> Result<Completion, DeviceError>;

    /// Read the candidates of the last finished round on `slot`.
    fn collect(&mut self, slot: KernelSlot) -> Result<Vec<Vec<u32>>, DeviceError>;
}

/// Source of compute devices.
pub trait DevicePlatform: Send + Sync {
    /// List the usable devices, in index order.
    fn enumerate(&self) -> Result<Vec<Box<dyn ComputeDevice>>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completion_resolves_with_signalled_result() {
        let (signal, completion) = completion_pair();
        signal.complete(Err(DeviceError::Execution("boom".into())));
        assert_eq!(completion.await, Err(DeviceError::Execution("boom".into())));

        let (signal, completion) = completion_pair();
        std::thread::spawn(move || signal.complete(Ok(())));
        assert_eq!(completion.await, Ok(()));
    }

    #[tokio::test]
    async fn dropped_signal_is_an_error() {
        let (signal, completion) = completion_pair();
        drop(signal);
        assert_eq!(completion.await, Err(DeviceError::CompletionDropped));
    }
}
