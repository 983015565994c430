use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use hds_miner_core::work::evaluate_candidate;
use hds_miner_device::{ComputeDevice, DeviceError, KernelSlot};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{DeviceStage, EngineEvent};
use crate::session::{SharedSession, SubmitError};
use crate::solver::{PreparedSlots, Solver};

/// Atomic cell holding a [`DeviceStage`], written by the pipeline and
/// sampled by the engine.
#[derive(Debug)]
pub(crate) struct StageCell(AtomicU8);

impl StageCell {
    fn encode(stage: DeviceStage) -> u8 {
        match stage {
            DeviceStage::Idle => 0,
            DeviceStage::Dispatched => 1,
            DeviceStage::Collecting => 2,
            DeviceStage::Paused => 3,
            DeviceStage::Failed => 4,
        }
    }

    pub(crate) fn new(stage: DeviceStage) -> Self {
        Self(AtomicU8::new(Self::encode(stage)))
    }

    pub(crate) fn set(&self, stage: DeviceStage) {
        self.0.store(Self::encode(stage), Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> DeviceStage {
        match self.0.load(Ordering::Relaxed) {
            0 => DeviceStage::Idle,
            1 => DeviceStage::Dispatched,
            2 => DeviceStage::Collecting,
            3 => DeviceStage::Paused,
            _ => DeviceStage::Failed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct PipelineStats {
    pub(crate) stage: StageCell,
    pub(crate) rounds: AtomicU64,
    pub(crate) solutions: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn new() -> Self {
        Self {
            stage: StageCell::new(DeviceStage::Idle),
            rounds: AtomicU64::new(0),
            solutions: AtomicU64::new(0),
        }
    }
}

pub(crate) struct PipelineContext {
    pub(crate) device_idx: usize,
    pub(crate) session: Arc<SharedSession>,
    pub(crate) events: mpsc::UnboundedSender<EngineEvent>,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) stop: CancellationToken,
    pub(crate) pause_poll: Duration,
    pub(crate) dispatch_timeout: Option<Duration>,
}

async fn prepare_blocking(
    mut device: Box<dyn ComputeDevice>,
    solver: Solver,
) -> Result<(Box<dyn ComputeDevice>, KernelSlot), DeviceError> {
    let (device, res) = tokio::task::spawn_blocking(move || {
        let res = solver.prepare(device.as_mut());
        (device, res)
    })
    .await
    .map_err(|err| DeviceError::Prepare {
        variant: solver.variant(),
        message: format!("prepare task failed: {err}"),
    })?;
    Ok((device, res?))
}

/// Feed one device until `stop` fires or the device fails.
///
/// A round that is already dispatched when `stop` fires runs to completion
/// and its candidates are still submitted.
pub(crate) async fn run_pipeline(
    mut device: Box<dyn ComputeDevice>,
    ctx: PipelineContext,
) -> Result<(), DeviceError> {
    let idx = ctx.device_idx;
    let mut slots = PreparedSlots::default();
    let mut paused = false;

    loop {
        if ctx.stop.is_cancelled() {
            return Ok(());
        }

        ctx.stats.stage.set(DeviceStage::Idle);
        let snapshot = ctx.session.work_snapshot();
        if !snapshot.has_work() {
            if !paused {
                debug!(device = idx, "no valid work, pausing");
                paused = true;
            }
            ctx.stats.stage.set(DeviceStage::Paused);
            tokio::select! {
                _ = ctx.stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(ctx.pause_poll) => continue,
            }
        }
        if paused {
            debug!(device = idx, work_id = snapshot.work_id, "work available, resuming");
            paused = false;
        }

        let solver = Solver::for_variant(snapshot.variant);
        let slot = match slots.get(solver) {
            Some(slot) => slot,
            None => {
                info!(device = idx, variant = %solver.variant(), "preparing kernels");
                let (returned, slot) = prepare_blocking(device, solver).await?;
                device = returned;
                slots.insert(solver, slot);
                slot
            }
        };

        let completion = solver.dispatch(device.as_mut(), slot, &snapshot)?;
        ctx.stats.stage.set(DeviceStage::Dispatched);
        match ctx.dispatch_timeout {
            Some(limit) => tokio::time::timeout(limit, completion)
                .await
                .map_err(|_| DeviceError::Execution(format!("round did not complete within {limit:?}")))??,
            None => completion.await?,
        }

        ctx.stats.stage.set(DeviceStage::Collecting);
        let candidates = solver.collect(device.as_mut(), slot)?;
        ctx.stats.rounds.fetch_add(1, Ordering::Relaxed);

        for indices in candidates {
            let encoded = match evaluate_candidate(&snapshot, &indices) {
                Ok(Some(encoded)) => encoded,
                Ok(None) => continue,
                Err(err) => {
                    warn!(device = idx, error = %err, "discarding candidate");
                    let _ = ctx.events.send(EngineEvent::Warning {
                        message: format!("device {idx}: discarded candidate: {err}"),
                    });
                    continue;
                }
            };

            match ctx.session.submit(&snapshot, &encoded) {
                Ok(()) => {
                    ctx.stats.solutions.fetch_add(1, Ordering::Relaxed);
                    info!(device = idx, work_id = snapshot.work_id, nonce = %snapshot.nonce.to_hex(), "solution found");
                    let _ = ctx.events.send(EngineEvent::SolutionSubmitted {
                        device_idx: idx,
                        work_id: snapshot.work_id,
                        nonce: snapshot.nonce.to_hex(),
                        variant: snapshot.variant,
                    });
                }
                Err(err) => {
                    let reason = match err {
                        SubmitError::QueueFull => "outbound queue full",
                        SubmitError::Disconnected => "pool connection closed",
                    };
                    warn!(device = idx, work_id = snapshot.work_id, reason, "dropping solution");
                    let _ = ctx.events.send(EngineEvent::Warning {
                        message: format!("device {idx}: dropped solution for work {}: {reason}", snapshot.work_id),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use hds_miner_core::solution::{PRE_FORK_C_BIT_LEN, pack_hds_iii, pack_minimal};
    use hds_miner_core::variant::{SolverVariant, hds_iii_header};
    use hds_miner_device::ScriptedDevice;

    use super::*;
    use crate::protocol::parse_inbound;

    const HEADER_HEX: &str = "3333333333333333333333333333333333333333333333333333333333333333";

    struct Fixture {
        session: Arc<SharedSession>,
        outbound: mpsc::Receiver<String>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
        stop: CancellationToken,
    }

    impl Fixture {
        fn new(forced: Option<SolverVariant>) -> Self {
            let (session, outbound) = SharedSession::with_nonce_start(forced, 100);
            let (events_tx, events) = mpsc::unbounded_channel();
            Self {
                session: Arc::new(session),
                outbound,
                events,
                events_tx,
                stop: CancellationToken::new(),
            }
        }

        fn feed(&self, line: &str) {
            self.session.apply(parse_inbound(line).unwrap());
        }

        fn job(&self, id: i64) {
            self.feed(&format!(r#"{{"method":"job","id":{id},"input":"{HEADER_HEX}","difficulty":0}}"#));
        }

        fn spawn(
            &self,
            device: ScriptedDevice,
            dispatch_timeout: Option<Duration>,
        ) -> (Arc<PipelineStats>, tokio::task::JoinHandle<Result<(), DeviceError>>) {
            let stats = Arc::new(PipelineStats::new());
            let ctx = PipelineContext {
                device_idx: device.info().index,
                session: Arc::clone(&self.session),
                events: self.events_tx.clone(),
                stats: Arc::clone(&stats),
                stop: self.stop.clone(),
                pause_poll: Duration::from_millis(10),
                dispatch_timeout,
            };
            (stats, tokio::spawn(run_pipeline(Box::new(device), ctx)))
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn fast(index: usize) -> ScriptedDevice {
        ScriptedDevice::new(index).with_round_time(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn failed_prepare_does_not_affect_other_devices() {
        let fx = Fixture::new(Some(SolverVariant::HdsI));
        fx.job(1);

        let broken = fast(0).failing_prepare(SolverVariant::HdsI);
        let healthy = fast(1);
        let observer = healthy.clone();

        let (_, broken_task) = fx.spawn(broken, None);
        let (stats, healthy_task) = fx.spawn(healthy, None);

        assert!(matches!(
            broken_task.await.unwrap(),
            Err(DeviceError::Prepare { .. })
        ));
        wait_until(|| stats.rounds.load(Ordering::Relaxed) >= 3).await;
        assert_eq!(observer.prepare_calls(), 1);

        fx.stop.cancel();
        assert!(healthy_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn end_to_end_single_submission() {
        let mut fx = Fixture::new(None);
        fx.job(77);

        let indices: Vec<u32> = (0..32).map(|i| i * 1_000_003 % (1 << 26)).collect();
        let device = fast(0)
            .with_candidates(vec![indices.clone()])
            .with_candidate_rounds(1)
            .recording();
        let observer = device.clone();
        let (stats, task) = fx.spawn(device, None);

        let line = fx.outbound.recv().await.unwrap();
        let msg: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        let first_round = observer.dispatched()[0].clone();
        assert_eq!(msg["method"], "solution");
        assert_eq!(msg["id"], "77");
        assert_eq!(msg["nonce"], first_round.nonce.to_hex());
        assert_eq!(
            msg["output"],
            hex::encode(pack_minimal(&indices, PRE_FORK_C_BIT_LEN).unwrap())
        );

        wait_until(|| stats.rounds.load(Ordering::Relaxed) >= 4).await;
        assert!(fx.outbound.try_recv().is_err());
        assert_eq!(stats.solutions.load(Ordering::Relaxed), 1);

        fx.feed(r#"{"method":"result","id":"77","code":1}"#);
        assert_eq!(fx.session.accepted(), 1);

        let mut submitted = 0;
        while let Ok(event) = fx.events.try_recv() {
            if let EngineEvent::SolutionSubmitted { work_id: 77, .. } = event {
                submitted += 1;
            }
        }
        assert_eq!(submitted, 1);

        fx.stop.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn hds_iii_rounds_use_prehashed_header_and_wide_layout() {
        let mut fx = Fixture::new(Some(SolverVariant::HdsIII));
        fx.job(31);

        let words: Vec<u32> = (0..32).map(|i| 0xA5A5_0000 | (i * 0x0101)).collect();
        let device = fast(0)
            .with_candidates(vec![words.clone()])
            .with_candidate_rounds(1)
            .recording();
        let observer = device.clone();
        let (_, task) = fx.spawn(device, None);

        let line = fx.outbound.recv().await.unwrap();
        let msg: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        let first_round = observer.dispatched()[0].clone();
        assert_eq!(first_round.variant, SolverVariant::HdsIII);
        assert_eq!(
            first_round.header,
            hds_iii_header(&[0x33; 32], first_round.nonce.as_bytes(), &[0; 4])
        );
        assert_ne!(first_round.header, [0x33; 32]);

        let expected = pack_hds_iii(&words, &[0; 4]).unwrap();
        assert_eq!(expected.len(), 104);
        assert_eq!(msg["id"], "31");
        assert_eq!(msg["nonce"], first_round.nonce.to_hex());
        assert_eq!(msg["output"], hex::encode(&expected));

        fx.stop.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pauses_until_work_arrives() {
        let fx = Fixture::new(None);
        let device = fast(0);
        let observer = device.clone();
        let (stats, task) = fx.spawn(device, None);

        wait_until(|| stats.stage.get() == DeviceStage::Paused).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(observer.rounds(), 0);

        fx.job(2);
        wait_until(|| observer.rounds() > 0).await;

        fx.feed(r#"{"method":"cancel","id":2}"#);
        wait_until(|| stats.stage.get() == DeviceStage::Paused).await;

        fx.stop.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn device_errors_end_the_pipeline() {
        let fx = Fixture::new(None);
        fx.job(1);

        let (_, task) = fx.spawn(fast(0).failing_execution_after(1), None);
        assert!(matches!(task.await.unwrap(), Err(DeviceError::Execution(_))));

        let (_, task) = fx.spawn(fast(1).failing_dispatch_after(0), None);
        assert!(matches!(task.await.unwrap(), Err(DeviceError::Dispatch(_))));

        let (stats, task) = fx.spawn(fast(2).hanging_after(0), Some(Duration::from_millis(30)));
        assert!(matches!(task.await.unwrap(), Err(DeviceError::Execution(_))));
        assert_eq!(stats.rounds.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn bad_candidates_are_discarded() {
        let mut fx = Fixture::new(None);
        fx.job(5);

        let (stats, task) = fx.spawn(fast(0).with_candidates(vec![vec![1, 2, 3]]), None);
        wait_until(|| stats.rounds.load(Ordering::Relaxed) >= 2).await;
        assert!(fx.outbound.try_recv().is_err());
        assert!(matches!(fx.events.recv().await, Some(EngineEvent::Warning { .. })));

        fx.stop.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_finishes_the_round_in_flight() {
        let fx = Fixture::new(None);
        fx.job(9);

        let device = ScriptedDevice::new(0).with_round_time(Duration::from_millis(100));
        let (stats, task) = fx.spawn(device, None);
        wait_until(|| stats.stage.get() == DeviceStage::Dispatched).await;

        fx.stop.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(stats.rounds.load(Ordering::Relaxed), 1);
    }
}
