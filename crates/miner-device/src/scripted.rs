use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hds_miner_core::variant::SolverVariant;

use crate::api::{
    completion_pair, Completion, CompletionSignal, ComputeDevice, DeviceError, DeviceInfo,
    DevicePlatform, KernelInput, KernelSlot,
};

/// Default length of one scripted round.
pub const DEFAULT_ROUND_TIME: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct ScriptState {
    slots: HashMap<KernelSlot, SolverVariant>,
    prepare_calls: usize,
    rounds: usize,
    last_input: Option<KernelInput>,
    history: Option<Vec<KernelInput>>,
    finished: HashMap<KernelSlot, bool>,
    hung: Vec<CompletionSignal>,
}

/// A fake device that finishes each round after a fixed delay and reports a
/// fixed list of candidates.
///
/// Clones share their state, so a test can keep a clone to inspect what the
/// engine dispatched. Only the round count and the latest input are kept
/// unless [`ScriptedDevice::recording`] is set, so long dry runs stay flat.
#[derive(Debug, Clone)]
pub struct ScriptedDevice {
    info: DeviceInfo,
    round_time: Duration,
    candidates: Vec<Vec<u32>>,
    candidate_rounds: Option<usize>,
    fail_prepare: Option<SolverVariant>,
    fail_dispatch_after: Option<usize>,
    fail_execution_after: Option<usize>,
    hang_after: Option<usize>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedDevice {
    /// A device that never finds candidates.
    pub fn new(index: usize) -> Self {
        Self {
            info: DeviceInfo {
                index,
                name: format!("scripted-{index}"),
            },
            round_time: DEFAULT_ROUND_TIME,
            candidates: Vec::new(),
            candidate_rounds: None,
            fail_prepare: None,
            fail_dispatch_after: None,
            fail_execution_after: None,
            hang_after: None,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    /// Set the round length.
    pub fn with_round_time(mut self, round_time: Duration) -> Self {
        self.round_time = round_time;
        self
    }

    /// Report `candidates` after every round.
    pub fn with_candidates(mut self, candidates: Vec<Vec<u32>>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Only the first `rounds` rounds report candidates.
    pub fn with_candidate_rounds(mut self, rounds: usize) -> Self {
        self.candidate_rounds = Some(rounds);
        self
    }

    /// Fail `prepare` for `variant`.
    pub fn failing_prepare(mut self, variant: SolverVariant) -> Self {
        self.fail_prepare = Some(variant);
        self
    }

    /// Refuse every dispatch after the first `rounds`.
    pub fn failing_dispatch_after(mut self, rounds: usize) -> Self {
        self.fail_dispatch_after = Some(rounds);
        self
    }

    /// Complete every round after the first `rounds` with an execution error.
    pub fn failing_execution_after(mut self, rounds: usize) -> Self {
        self.fail_execution_after = Some(rounds);
        self
    }

    /// Never complete rounds after the first `rounds`.
    pub fn hanging_after(mut self, rounds: usize) -> Self {
        self.hang_after = Some(rounds);
        self
    }

    /// Keep the input of every dispatch for [`ScriptedDevice::dispatched`].
    pub fn recording(self) -> Self {
        self.lock().history.get_or_insert_with(Vec::new);
        self
    }

    /// Inputs of every dispatch so far. Empty unless recording.
    pub fn dispatched(&self) -> Vec<KernelInput> {
        self.lock().history.clone().unwrap_or_default()
    }

    /// Number of accepted dispatches so far.
    pub fn rounds(&self) -> usize {
        self.lock().rounds
    }

    /// Input of the most recent dispatch.
    pub fn last_input(&self) -> Option<KernelInput> {
        self.lock().last_input.clone()
    }

    /// Number of `prepare` calls so far.
    pub fn prepare_calls(&self) -> usize {
        self.lock().prepare_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ComputeDevice for ScriptedDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn prepare(&mut self, variant: SolverVariant) -> Result<KernelSlot, DeviceError> {
        let mut state = self.lock();
        state.prepare_calls += 1;
        if self.fail_prepare == Some(variant) {
            return Err(DeviceError::Prepare {
                variant,
                message: format!("{} has no kernels for this variant", self.info.name),
            });
        }
        let slot = KernelSlot(variant.ordinal());
        state.slots.insert(slot, variant);
        Ok(slot)
    }

    fn dispatch(&mut self, slot: KernelSlot, input: &KernelInput) -> Result<Completion, DeviceError> {
        let mut state = self.lock();
        if !state.slots.contains_key(&slot) {
            return Err(DeviceError::UnknownSlot(slot));
        }
        let round = state.rounds;
        if self.fail_dispatch_after.is_some_and(|n| round >= n) {
            return Err(DeviceError::Dispatch(format!("{} queue rejected round {round}", self.info.name)));
        }
        state.rounds += 1;
        state.last_input = Some(input.clone());
        if let Some(history) = state.history.as_mut() {
            history.push(input.clone());
        }
        state.finished.insert(slot, false);

        let (signal, completion) = completion_pair();
        if self.hang_after.is_some_and(|n| round >= n) {
            state.hung.push(signal);
            return Ok(completion);
        }

        let result = if self.fail_execution_after.is_some_and(|n| round >= n) {
            Err(DeviceError::Execution(format!("{} faulted in round {round}", self.info.name)))
        } else {
            Ok(())
        };
        let round_time = self.round_time;
        let shared = Arc::clone(&self.state);
        std::thread::spawn(move || {
            std::thread::sleep(round_time);
            if result.is_ok() {
                let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                state.finished.insert(slot, true);
            }
            signal.complete(result);
        });
        Ok(completion)
    }

    fn collect(&mut self, slot: KernelSlot) -> Result<Vec<Vec<u32>>, DeviceError> {
        let state = self.lock();
        if !state.slots.contains_key(&slot) {
            return Err(DeviceError::UnknownSlot(slot));
        }
        match state.finished.get(&slot) {
            Some(true) => {
                let round = state.rounds.saturating_sub(1);
                if self.candidate_rounds.is_some_and(|n| round >= n) {
                    Ok(Vec::new())
                } else {
                    Ok(self.candidates.clone())
                }
            }
            _ => Err(DeviceError::Collect(format!("{} has no finished round", self.info.name))),
        }
    }
}

/// Platform listing a fixed set of scripted devices.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPlatform {
    devices: Vec<ScriptedDevice>,
}

impl ScriptedPlatform {
    /// `count` idle devices with default timing.
    pub fn idle(count: usize) -> Self {
        Self::from_devices((0..count).map(ScriptedDevice::new).collect())
    }

    /// Platform over the given devices.
    pub fn from_devices(devices: Vec<ScriptedDevice>) -> Self {
        Self { devices }
    }
}

impl DevicePlatform for ScriptedPlatform {
    fn enumerate(&self) -> Result<Vec<Box<dyn ComputeDevice>>, DeviceError> {
        Ok(self
            .devices
            .iter()
            .cloned()
            .map(|d| Box::new(d) as Box<dyn ComputeDevice>)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hds_miner_core::work::Nonce;

    fn input(variant: SolverVariant) -> KernelInput {
        KernelInput {
            variant,
            header: [1; 32],
            nonce: Nonce::compose(&[], 5),
        }
    }

    #[tokio::test]
    async fn round_completes_and_returns_candidates() {
        let mut device = ScriptedDevice::new(0)
            .with_round_time(Duration::from_millis(5))
            .with_candidates(vec![vec![1, 2, 3]])
            .recording();
        let observer = device.clone();

        let slot = device.prepare(SolverVariant::HdsII).unwrap();
        let completion = device.dispatch(slot, &input(SolverVariant::HdsII)).unwrap();
        completion.await.unwrap();

        assert_eq!(device.collect(slot).unwrap(), vec![vec![1, 2, 3]]);
        assert_eq!(observer.dispatched(), vec![input(SolverVariant::HdsII)]);
        assert_eq!(observer.prepare_calls(), 1);
    }

    #[tokio::test]
    async fn unrecorded_device_only_counts_rounds() {
        let mut device = ScriptedDevice::new(5).with_round_time(Duration::ZERO);
        let observer = device.clone();
        let slot = device.prepare(SolverVariant::HdsI).unwrap();

        for extra in 0..50u64 {
            let mut round = input(SolverVariant::HdsI);
            round.nonce = Nonce::compose(&[], extra);
            device.dispatch(slot, &round).unwrap().await.unwrap();
        }

        assert_eq!(observer.rounds(), 50);
        assert!(observer.dispatched().is_empty());
        assert_eq!(observer.last_input().map(|i| i.nonce), Some(Nonce::compose(&[], 49)));
    }

    #[tokio::test]
    async fn scripted_failures() {
        let mut device = ScriptedDevice::new(1).failing_prepare(SolverVariant::HdsIII);
        assert!(matches!(
            device.prepare(SolverVariant::HdsIII),
            Err(DeviceError::Prepare { .. })
        ));
        assert_eq!(
            device.dispatch(KernelSlot(9), &input(SolverVariant::HdsI)).err(),
            Some(DeviceError::UnknownSlot(KernelSlot(9)))
        );

        let mut device = ScriptedDevice::new(2)
            .with_round_time(Duration::ZERO)
            .failing_execution_after(0);
        let slot = device.prepare(SolverVariant::HdsI).unwrap();
        let completion = device.dispatch(slot, &input(SolverVariant::HdsI)).unwrap();
        assert!(matches!(completion.await, Err(DeviceError::Execution(_))));
        assert!(matches!(device.collect(slot), Err(DeviceError::Collect(_))));

        let mut device = ScriptedDevice::new(3)
            .with_round_time(Duration::ZERO)
            .failing_dispatch_after(1);
        let slot = device.prepare(SolverVariant::HdsI).unwrap();
        device.dispatch(slot, &input(SolverVariant::HdsI)).unwrap().await.unwrap();
        assert!(matches!(
            device.dispatch(slot, &input(SolverVariant::HdsI)),
            Err(DeviceError::Dispatch(_))
        ));
    }

    #[tokio::test]
    async fn candidates_limited_to_first_rounds() {
        let mut device = ScriptedDevice::new(4)
            .with_round_time(Duration::ZERO)
            .with_candidates(vec![vec![7]])
            .with_candidate_rounds(1);
        let slot = device.prepare(SolverVariant::HdsI).unwrap();

        device.dispatch(slot, &input(SolverVariant::HdsI)).unwrap().await.unwrap();
        assert_eq!(device.collect(slot).unwrap(), vec![vec![7]]);
        device.dispatch(slot, &input(SolverVariant::HdsI)).unwrap().await.unwrap();
        assert!(device.collect(slot).unwrap().is_empty());
    }

    #[test]
    fn platform_lists_devices_in_order() {
        let devices = ScriptedPlatform::idle(3).enumerate().unwrap();
        let indices: Vec<usize> = devices.iter().map(|d| d.info().index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
