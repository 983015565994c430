use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownEvent {
    /// Finish the rounds in flight, flush solutions, then exit.
    Graceful,
    /// Exit now.
    Immediate,
}

/// Counts interrupts: the first asks for a graceful stop, any later one for
/// an immediate exit.
#[derive(Debug, Default)]
pub struct ShutdownController {
    interrupts: AtomicU8,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) -> ShutdownEvent {
        let previous = self.interrupts.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            ShutdownEvent::Graceful
        } else {
            ShutdownEvent::Immediate
        }
    }
}

pub fn spawn_ctrl_c_handler(
    shutdown: Arc<ShutdownController>,
    shutdown_tx: mpsc::UnboundedSender<ShutdownEvent>,
) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            let event = shutdown.interrupt();
            let _ = shutdown_tx.send(event);
            if event == ShutdownEvent::Immediate {
                return;
            }
        }
    });
}
