use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use hds_miner_core::difficulty::Difficulty;
use hds_miner_core::variant::{SolverVariant, UNKNOWN_HEIGHT, hds_iii_header, select_variant};
use hds_miner_core::work::{NO_WORK, Nonce, WorkSnapshot};
use rand::Rng;
use tokio::sync::mpsc;

use crate::protocol::{self, Inbound};

/// Outbound lines that may wait for the connection before submissions are dropped.
pub(crate) const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// The pool's current job. Only `apply` writes it.
#[derive(Debug, Clone)]
struct JobState {
    work_id: i64,
    header: [u8; 32],
    difficulty: Difficulty,
    pool_nonce_prefix: Vec<u8>,
    extra_nonce: [u8; 4],
    block_height: u64,
    fork_height: u64,
    fork_height2: u64,
}

impl Default for JobState {
    fn default() -> Self {
        Self {
            work_id: NO_WORK,
            header: [0; 32],
            difficulty: Difficulty::default(),
            pool_nonce_prefix: Vec::new(),
            extra_nonce: [0; 4],
            block_height: UNKNOWN_HEIGHT,
            fork_height: UNKNOWN_HEIGHT,
            fork_height2: UNKNOWN_HEIGHT,
        }
    }
}

/// What an inbound message did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InboundOutcome {
    LoginAccepted { nonce_prefix: Vec<u8> },
    LoginRejected { code: i64 },
    ShareAccepted { id: String },
    ShareRejected { id: String, code: i64 },
    NewJob {
        work_id: i64,
        difficulty: Difficulty,
        height: Option<u64>,
        fork_reached: bool,
    },
    Cancelled { work_id: i64, matched: bool },
    Ignored { method: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitError {
    QueueFull,
    Disconnected,
}

/// State shared between the connection task and the device pipelines.
pub(crate) struct SharedSession {
    job: Mutex<JobState>,
    forced: Option<SolverVariant>,
    nonce: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    outbound: mpsc::Sender<String>,
}

impl SharedSession {
    /// New session with a random nonce start. The receiver is the outbound
    /// write queue drained by the connection.
    pub(crate) fn new(forced: Option<SolverVariant>) -> (Self, mpsc::Receiver<String>) {
        let start = rand::thread_rng().gen_range(0..1u64 << 63);
        Self::with_nonce_start(forced, start)
    }

    pub(crate) fn with_nonce_start(
        forced: Option<SolverVariant>,
        start: u64,
    ) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Self {
            job: Mutex::new(JobState::default()),
            forced,
            nonce: AtomicU64::new(start),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            outbound: tx,
        };
        (session, rx)
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy the current job for one dispatch and reserve a fresh nonce.
    pub(crate) fn work_snapshot(&self) -> WorkSnapshot {
        let counter = self.nonce.fetch_add(1, Ordering::Relaxed);
        let (snapshot, raw_header) = {
            let job = self.lock();
            let variant = select_variant(self.forced, job.block_height, job.fork_height, job.fork_height2);
            let snapshot = WorkSnapshot {
                variant,
                work_id: job.work_id,
                nonce: Nonce::compose(&job.pool_nonce_prefix, counter),
                header: job.header,
                difficulty: job.difficulty,
                extra_nonce: job.extra_nonce,
            };
            (snapshot, job.header)
        };

        if snapshot.variant == SolverVariant::HdsIII {
            WorkSnapshot {
                header: hds_iii_header(&raw_header, snapshot.nonce.as_bytes(), &snapshot.extra_nonce),
                ..snapshot
            }
        } else {
            snapshot
        }
    }

    /// Current work id, [`NO_WORK`] when there is none.
    pub(crate) fn work_id(&self) -> i64 {
        self.lock().work_id
    }

    /// Mark the current job unusable, e.g. after losing the connection.
    pub(crate) fn invalidate_work(&self) {
        self.lock().work_id = NO_WORK;
    }

    pub(crate) fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub(crate) fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Apply a parsed pool message.
    pub(crate) fn apply(&self, msg: Inbound) -> InboundOutcome {
        match msg {
            Inbound::Login(login) => {
                if login.code < 0 {
                    return InboundOutcome::LoginRejected { code: login.code };
                }
                let mut job = self.lock();
                job.pool_nonce_prefix = login.nonce_prefix.unwrap_or_default();
                if let Some(h) = login.fork_height {
                    job.fork_height = h;
                }
                if let Some(h) = login.fork_height2 {
                    job.fork_height2 = h;
                }
                InboundOutcome::LoginAccepted {
                    nonce_prefix: job.pool_nonce_prefix.clone(),
                }
            }
            Inbound::ShareResult { id, code } => {
                if code == 1 {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    InboundOutcome::ShareAccepted { id }
                } else {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    InboundOutcome::ShareRejected { id, code }
                }
            }
            Inbound::Job(msg) => {
                let mut job = self.lock();
                job.work_id = msg.id;
                job.header = msg.header;
                job.difficulty = msg.difficulty;
                if let Some(prefix) = msg.nonce_prefix {
                    job.pool_nonce_prefix = prefix;
                }
                if let Some(h) = msg.fork_height {
                    job.fork_height = h;
                }
                if let Some(h) = msg.fork_height2 {
                    job.fork_height2 = h;
                }
                let mut fork_reached = false;
                if let Some(height) = msg.height {
                    job.block_height = height;
                    fork_reached = height != UNKNOWN_HEIGHT
                        && (height == job.fork_height || height == job.fork_height2);
                }
                InboundOutcome::NewJob {
                    work_id: msg.id,
                    difficulty: msg.difficulty,
                    height: msg.height,
                    fork_reached,
                }
            }
            Inbound::Cancel { id } => {
                let mut job = self.lock();
                let matched = job.work_id == id;
                if matched {
                    job.work_id = NO_WORK;
                }
                InboundOutcome::Cancelled { work_id: id, matched }
            }
            Inbound::Other { method } => InboundOutcome::Ignored { method },
        }
    }

    /// Queue a solution for the pool without waiting.
    pub(crate) fn submit(&self, snapshot: &WorkSnapshot, encoded: &[u8]) -> Result<(), SubmitError> {
        let line = protocol::solution_line(snapshot.work_id, &snapshot.nonce, encoded);
        self.outbound.try_send(line).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Disconnected,
        })
    }
}
