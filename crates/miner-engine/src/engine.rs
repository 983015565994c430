use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use hds_miner_core::difficulty::Difficulty;
use hds_miner_core::work::NO_WORK;
use hds_miner_device::{ComputeDevice, DeviceError, DevicePlatform};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{DeviceSnapshot, DeviceStage, EngineConfig, EngineEvent, EngineHandle, StatusSnapshot};
use crate::connection::{ConnectionConfig, run_connection};
use crate::error::SessionError;
use crate::pipeline::{PipelineContext, PipelineStats, run_pipeline};
use crate::session::SharedSession;

/// Upper bound on flushing queued solutions once the pipelines are done.
const CONNECTION_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
}

impl EngineInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(EngineEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

struct DeviceRuntime {
    device_idx: usize,
    name: String,
    stats: Arc<PipelineStats>,
    stage: DeviceStage,
}

impl DeviceRuntime {
    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_idx: self.device_idx,
            name: self.name.clone(),
            stage: self.stage,
            rounds: self.stats.rounds.load(Ordering::Relaxed),
            solutions: self.stats.solutions.load(Ordering::Relaxed),
        }
    }
}

struct EngineRuntime {
    cfg: EngineConfig,
    session: Arc<SharedSession>,

    devices: Vec<DeviceRuntime>,
    pipeline_ids: HashMap<tokio::task::Id, usize>,
    pipelines: JoinSet<Result<(), DeviceError>>,
    pipeline_stop: CancellationToken,

    connection: Option<tokio::task::JoinHandle<Result<(), SessionError>>>,
    connection_stop: CancellationToken,

    internal_rx: mpsc::UnboundedReceiver<EngineEvent>,
    connected: bool,
    difficulty: Option<Difficulty>,
    started_at: i64,

    snapshot_tx: watch::Sender<StatusSnapshot>,
    inner: Arc<EngineInner>,
}

impl EngineRuntime {
    fn build_snapshot(&self) -> StatusSnapshot {
        let work_id = self.session.work_id();
        StatusSnapshot {
            stop_requested: self.inner.should_stop(),
            connected: self.connected,
            work_id: (work_id != NO_WORK).then_some(work_id),
            difficulty: self.difficulty,
            accepted: self.session.accepted(),
            rejected: self.session.rejected(),
            started_at: self.started_at,
            devices: self.devices.iter().map(DeviceRuntime::snapshot).collect(),
        }
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.build_snapshot());
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn handle_internal_event(&mut self, ev: EngineEvent) {
        match &ev {
            EngineEvent::LoginAccepted { .. } => self.connected = true,
            EngineEvent::ConnectionLost { .. } => {
                self.connected = false;
                self.difficulty = None;
            }
            EngineEvent::NewJob { difficulty, .. } => self.difficulty = Some(*difficulty),
            EngineEvent::JobCancelled { .. } => self.difficulty = None,
            _ => {}
        }
        self.emit(ev);
        self.push_snapshot();
    }

    fn sample_stages(&mut self) {
        let mut changed = Vec::new();
        for device in &mut self.devices {
            if device.stage == DeviceStage::Failed {
                continue;
            }
            let stage = device.stats.stage.get();
            if stage != device.stage {
                device.stage = stage;
                changed.push((device.device_idx, stage));
            }
        }
        for (device_idx, stage) in changed {
            self.emit(EngineEvent::DeviceStage { device_idx, stage });
        }
        self.push_snapshot();
    }

    fn handle_pipeline_exit(
        &mut self,
        res: Result<(tokio::task::Id, Result<(), DeviceError>), tokio::task::JoinError>,
    ) {
        let (id, message) = match res {
            Ok((_, Ok(()))) => return,
            Ok((id, Err(err))) => (id, err.to_string()),
            Err(err) => (err.id(), format!("pipeline task failed: {err}")),
        };
        let Some(pos) = self.pipeline_ids.remove(&id) else {
            return;
        };
        let device = &mut self.devices[pos];
        device.stage = DeviceStage::Failed;
        device.stats.stage.set(DeviceStage::Failed);
        let device_idx = device.device_idx;

        error!(device = device_idx, %message, "device failed, dropping it");
        self.emit(EngineEvent::DeviceFailed {
            device_idx,
            message,
        });
        self.emit(EngineEvent::DeviceStage {
            device_idx,
            stage: DeviceStage::Failed,
        });
        self.push_snapshot();
    }

    async fn shutdown(&mut self) {
        self.pipeline_stop.cancel();
        while let Some(res) = self.pipelines.join_next_with_id().await {
            self.handle_pipeline_exit(res);
        }

        self.connection_stop.cancel();
        if let Some(task) = self.connection.take() {
            let abort = task.abort_handle();
            match tokio::time::timeout(CONNECTION_FLUSH_TIMEOUT, task).await {
                Ok(Ok(Err(err))) if !err.is_fatal() => {
                    warn!(error = %err, "pool connection ended with an error");
                }
                Ok(_) => {}
                Err(_) => {
                    warn!("pool connection did not close in time");
                    abort.abort();
                }
            }
        }

        while let Ok(ev) = self.internal_rx.try_recv() {
            self.handle_internal_event(ev);
        }
    }

    async fn run(mut self) -> anyhow::Result<()> {
        self.emit(EngineEvent::Started);
        self.push_snapshot();

        let mut status_tick = tokio::time::interval(self.cfg.status_tick);
        status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut result: anyhow::Result<()> = Ok(());

        loop {
            if self.inner.should_stop() {
                info!("stop requested, finishing in-flight rounds");
                break;
            }
            if self.pipelines.is_empty() {
                result = Err(anyhow::anyhow!("no compute device left"));
                break;
            }

            let loop_result: anyhow::Result<()> = tokio::select! {
                _ = status_tick.tick() => {
                    self.sample_stages();
                    Ok(())
                }
                _ = self.inner.notify.notified() => Ok(()),
                ev_opt = self.internal_rx.recv() => {
                    if let Some(ev) = ev_opt {
                        self.handle_internal_event(ev);
                    }
                    Ok(())
                }
                Some(res) = self.pipelines.join_next_with_id() => {
                    self.handle_pipeline_exit(res);
                    Ok(())
                }
                res = async {
                    match self.connection.as_mut() {
                        Some(task) => task.await,
                        None => std::future::pending::<Result<Result<(), SessionError>, tokio::task::JoinError>>().await,
                    }
                } => {
                    self.connection = None;
                    match res {
                        Ok(Ok(())) => Err(anyhow::anyhow!("pool connection task exited unexpectedly")),
                        Ok(Err(err)) => Err(err.into()),
                        Err(err) => Err(anyhow::anyhow!("pool connection task join error: {err:#}")),
                    }
                }
            };

            if let Err(err) = loop_result {
                result = Err(err);
                break;
            }
        }

        if let Err(err) = &result {
            error!("engine stopping: {err:#}");
            self.emit(EngineEvent::Error {
                message: format!("engine error: {err:#}"),
            });
        }

        self.shutdown().await;
        self.emit(EngineEvent::Stopped);
        self.push_snapshot();
        result
    }
}

fn empty_snapshot(stop_requested: bool, started_at: i64) -> StatusSnapshot {
    StatusSnapshot {
        stop_requested,
        connected: false,
        work_id: None,
        difficulty: None,
        accepted: 0,
        rejected: 0,
        started_at,
        devices: Vec::new(),
    }
}

pub(crate) fn start_engine(cfg: EngineConfig, platform: Arc<dyn DevicePlatform>) -> EngineHandle {
    let started_at = Utc::now().timestamp();
    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(empty_snapshot(false, started_at));

    let inner = Arc::new(EngineInner {
        event_tx,
        snapshot_rx,
        stop_requested: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
    });

    let join = tokio::spawn(run_engine(inner.clone(), snapshot_tx, cfg, platform, started_at));
    EngineHandle { inner, join }
}

fn fail_early(
    inner: &EngineInner,
    snapshot_tx: &watch::Sender<StatusSnapshot>,
    started_at: i64,
    message: String,
) -> anyhow::Error {
    error!(%message, "engine failed to start");
    let _ = inner.event_tx.send(EngineEvent::Error {
        message: message.clone(),
    });
    let _ = inner.event_tx.send(EngineEvent::Stopped);
    let _ = snapshot_tx.send(empty_snapshot(inner.should_stop(), started_at));
    anyhow::anyhow!("{message}")
}

async fn run_engine(
    inner: Arc<EngineInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    mut cfg: EngineConfig,
    platform: Arc<dyn DevicePlatform>,
    started_at: i64,
) -> anyhow::Result<()> {
    if cfg.reconnect_delay == Duration::ZERO {
        cfg.reconnect_delay = EngineConfig::DEFAULT_RECONNECT_DELAY;
    }
    if cfg.pause_poll == Duration::ZERO {
        cfg.pause_poll = EngineConfig::DEFAULT_PAUSE_POLL;
    }
    if cfg.status_tick == Duration::ZERO {
        cfg.status_tick = EngineConfig::DEFAULT_STATUS_TICK;
    }
    if cfg.dispatch_timeout == Some(Duration::ZERO) {
        cfg.dispatch_timeout = None;
    }

    let enumerated = match tokio::task::spawn_blocking(move || platform.enumerate()).await {
        Ok(Ok(devices)) => devices,
        Ok(Err(err)) => {
            return Err(fail_early(&inner, &snapshot_tx, started_at, format!("enumerate devices: {err}")));
        }
        Err(err) => {
            return Err(fail_early(&inner, &snapshot_tx, started_at, format!("enumerate devices: {err}")));
        }
    };

    let selected: Vec<Box<dyn ComputeDevice>> = if cfg.devices.is_empty() {
        enumerated
    } else {
        for wanted in &cfg.devices {
            if !enumerated.iter().any(|d| d.info().index == *wanted) {
                warn!(device = wanted, "requested device does not exist");
                let _ = inner.event_tx.send(EngineEvent::Warning {
                    message: format!("device {wanted} does not exist, ignoring it"),
                });
            }
        }
        enumerated
            .into_iter()
            .filter(|d| cfg.devices.contains(&d.info().index))
            .collect()
    };
    if selected.is_empty() {
        return Err(fail_early(&inner, &snapshot_tx, started_at, "no compute device selected".to_string()));
    }

    let (session, outbound_rx) = SharedSession::new(cfg.forced_variant);
    let session = Arc::new(session);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel::<EngineEvent>();

    let connection_stop = CancellationToken::new();
    let connection = tokio::spawn(run_connection(
        ConnectionConfig {
            host: cfg.host.clone(),
            port: cfg.port,
            api_key: cfg.api_key.clone(),
            reconnect_delay: cfg.reconnect_delay,
        },
        session.clone(),
        outbound_rx,
        internal_tx.clone(),
        connection_stop.clone(),
    ));

    let pipeline_stop = CancellationToken::new();
    let mut pipelines = JoinSet::new();
    let mut pipeline_ids = HashMap::new();
    let mut devices = Vec::with_capacity(selected.len());

    for (pos, device) in selected.into_iter().enumerate() {
        let info = device.info().clone();
        info!(device = info.index, name = %info.name, "starting device pipeline");

        let stats = Arc::new(PipelineStats::new());
        let ctx = PipelineContext {
            device_idx: info.index,
            session: session.clone(),
            events: internal_tx.clone(),
            stats: stats.clone(),
            stop: pipeline_stop.clone(),
            pause_poll: cfg.pause_poll,
            dispatch_timeout: cfg.dispatch_timeout,
        };
        let handle = pipelines.spawn(run_pipeline(device, ctx));
        pipeline_ids.insert(handle.id(), pos);

        devices.push(DeviceRuntime {
            device_idx: info.index,
            name: info.name,
            stats,
            stage: DeviceStage::Idle,
        });
    }
    drop(internal_tx);

    let runtime = EngineRuntime {
        cfg,
        session,
        devices,
        pipeline_ids,
        pipelines,
        pipeline_stop,
        connection: Some(connection),
        connection_stop,
        internal_rx,
        connected: false,
        difficulty: None,
        started_at,
        snapshot_tx,
        inner,
    };

    runtime.push_snapshot();
    runtime.run().await
}
