//! Public API types for the in-process `hds-miner` engine.

use std::sync::Arc;
use std::time::Duration;

use hds_miner_core::difficulty::Difficulty;
use hds_miner_core::variant::SolverVariant;
use hds_miner_device::DevicePlatform;
use serde::{Deserialize, Serialize};

/// Configuration for the in-process engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pool host name or address.
    pub host: String,

    /// Pool TCP port.
    pub port: u16,

    /// API key sent with `login`.
    pub api_key: String,

    /// Indices of the devices to mine on. Empty means every device.
    pub devices: Vec<usize>,

    /// Solve every job with this variant, ignoring fork heights.
    pub forced_variant: Option<SolverVariant>,

    /// Pause between connection attempts.
    pub reconnect_delay: Duration,

    /// How often a paused device checks for new work.
    pub pause_poll: Duration,

    /// Treat a device as failed when a round does not complete in time.
    ///
    /// `None` waits forever; a hung device then stays `Dispatched` until the
    /// engine stops.
    pub dispatch_timeout: Option<Duration>,

    /// How often device stages are sampled into the status snapshot.
    pub status_tick: Duration,
}

impl EngineConfig {
    /// Default reconnect backoff.
    pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

    /// Default re-poll interval of a paused device.
    pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_millis(200);

    /// Default status sampling tick.
    pub const DEFAULT_STATUS_TICK: Duration = Duration::from_millis(250);

    /// Config for `host:port` with defaults for everything else.
    pub fn new(host: impl Into<String>, port: u16, api_key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            api_key: api_key.into(),
            devices: Vec::new(),
            forced_variant: None,
            reconnect_delay: Self::DEFAULT_RECONNECT_DELAY,
            pause_poll: Self::DEFAULT_PAUSE_POLL,
            dispatch_timeout: None,
            status_tick: Self::DEFAULT_STATUS_TICK,
        }
    }
}

/// Stage of a device pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceStage {
    /// Fetching the next work snapshot.
    Idle,
    /// A search round is running on the device.
    Dispatched,
    /// Reading and checking candidates.
    Collecting,
    /// No valid job; waiting for one.
    Paused,
    /// The device failed and its pipeline was dropped.
    Failed,
}

/// Snapshot of a single device pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Device index as listed by the platform.
    pub device_idx: usize,
    /// Device name.
    pub name: String,
    /// Current stage.
    pub stage: DeviceStage,
    /// Completed search rounds.
    pub rounds: u64,
    /// Solutions handed to the pool connection.
    pub solutions: u64,
}

/// Engine event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started.
    Started,
    /// Engine is stopping (graceful shutdown requested).
    StopRequested,
    /// Opening a connection to the pool.
    Connecting {
        /// `host:port` being connected.
        server: String,
    },
    /// TLS session established with one endpoint.
    Connected {
        /// Resolved endpoint.
        endpoint: String,
    },
    /// The pool accepted the API key.
    LoginAccepted {
        /// Pool nonce prefix in hex, empty when none was assigned.
        nonce_prefix: String,
    },
    /// The connection failed or dropped; a retry follows.
    ConnectionLost {
        /// What went wrong.
        reason: String,
        /// Delay before the next attempt (milliseconds).
        retry_in_ms: u64,
    },
    /// The pool replaced the current job.
    NewJob {
        /// Work id.
        work_id: i64,
        /// Share difficulty.
        difficulty: Difficulty,
        /// Block height, when the pool sent one.
        height: Option<u64>,
        /// Accepted shares so far.
        accepted: u64,
        /// Rejected shares so far.
        rejected: u64,
    },
    /// The pool cancelled the current job.
    JobCancelled {
        /// Work id.
        work_id: i64,
    },
    /// A job arrived at one of the fork heights; the variant changes.
    ForkHeightReached {
        /// Block height of the job.
        height: u64,
    },
    /// A device found a solution and queued it for the pool.
    SolutionSubmitted {
        /// Device index.
        device_idx: usize,
        /// Work id the solution belongs to.
        work_id: i64,
        /// Nonce in hex.
        nonce: String,
        /// Variant that produced it.
        variant: SolverVariant,
    },
    /// The pool accepted a share.
    ShareAccepted {
        /// Work id echoed by the pool.
        work_id: String,
        /// Accepted shares so far.
        accepted: u64,
        /// Rejected shares so far.
        rejected: u64,
    },
    /// The pool rejected a share.
    ShareRejected {
        /// Work id echoed by the pool.
        work_id: String,
        /// Result code.
        code: i64,
        /// Accepted shares so far.
        accepted: u64,
        /// Rejected shares so far.
        rejected: u64,
    },
    /// Device stage transition.
    DeviceStage {
        /// Device index.
        device_idx: usize,
        /// New stage.
        stage: DeviceStage,
    },
    /// A device failed; its pipeline is gone.
    DeviceFailed {
        /// Device index.
        device_idx: usize,
        /// Failure detail.
        message: String,
    },
    /// A warning from the engine.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the engine.
    Error {
        /// Error message.
        message: String,
    },
    /// Engine stopped.
    Stopped,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Whether the engine has been asked to stop.
    pub stop_requested: bool,
    /// Whether a pool session is logged in.
    pub connected: bool,
    /// Current work id, if any.
    pub work_id: Option<i64>,
    /// Difficulty of the current job.
    pub difficulty: Option<Difficulty>,
    /// Accepted shares.
    pub accepted: u64,
    /// Rejected shares.
    pub rejected: u64,
    /// Engine start time (unix seconds).
    pub started_at: i64,
    /// Per-device snapshots.
    pub devices: Vec<DeviceSnapshot>,
}

/// Handle to a running in-process engine instance.
pub struct EngineHandle {
    pub(crate) inner: std::sync::Arc<crate::engine::EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a new in-process engine instance on the current tokio runtime.
pub fn start_engine(config: EngineConfig, platform: Arc<dyn DevicePlatform>) -> EngineHandle {
    crate::engine::start_engine(config, platform)
}

impl EngineHandle {
    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Request a graceful shutdown (finish in-flight rounds, stop fetching work).
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the engine to stop, returning the engine task result.
    ///
    /// A pool login rejection surfaces as a [`crate::SessionError`] inside the
    /// returned error.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}
