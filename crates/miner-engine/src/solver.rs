use hds_miner_core::variant::SolverVariant;
use hds_miner_core::work::WorkSnapshot;
use hds_miner_device::{Completion, ComputeDevice, DeviceError, KernelInput, KernelSlot};

/// Per-variant search strategy driven by a device pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Solver {
    HdsI,
    HdsII,
    HdsIII,
}

impl Solver {
    pub(crate) fn for_variant(variant: SolverVariant) -> Self {
        match variant {
            SolverVariant::HdsI => Solver::HdsI,
            SolverVariant::HdsII => Solver::HdsII,
            SolverVariant::HdsIII => Solver::HdsIII,
        }
    }

    pub(crate) fn variant(self) -> SolverVariant {
        match self {
            Solver::HdsI => SolverVariant::HdsI,
            Solver::HdsII => SolverVariant::HdsII,
            Solver::HdsIII => SolverVariant::HdsIII,
        }
    }

    /// May block while kernels build.
    pub(crate) fn prepare(self, device: &mut dyn ComputeDevice) -> Result<KernelSlot, DeviceError> {
        device.prepare(self.variant())
    }

    /// Start a round for `snapshot`. Returns as soon as the device accepted it.
    pub(crate) fn dispatch(
        self,
        device: &mut dyn ComputeDevice,
        slot: KernelSlot,
        snapshot: &WorkSnapshot,
    ) -> Result<Completion, DeviceError> {
        let input = KernelInput {
            variant: self.variant(),
            header: snapshot.header,
            nonce: snapshot.nonce,
        };
        device.dispatch(slot, &input)
    }

    /// Candidates of the finished round. Empty index sets are dropped.
    pub(crate) fn collect(
        self,
        device: &mut dyn ComputeDevice,
        slot: KernelSlot,
    ) -> Result<Vec<Vec<u32>>, DeviceError> {
        let mut candidates = device.collect(slot)?;
        candidates.retain(|c| !c.is_empty());
        Ok(candidates)
    }
}

/// Kernel slots prepared on one device, one per variant.
#[derive(Debug, Default)]
pub(crate) struct PreparedSlots([Option<KernelSlot>; 3]);

impl PreparedSlots {
    pub(crate) fn get(&self, solver: Solver) -> Option<KernelSlot> {
        self.0[solver.variant().ordinal()]
    }

    pub(crate) fn insert(&mut self, solver: Solver, slot: KernelSlot) {
        self.0[solver.variant().ordinal()] = Some(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_mapping_round_trips() {
        for variant in SolverVariant::ALL {
            assert_eq!(Solver::for_variant(variant).variant(), variant);
        }
    }

    #[test]
    fn slots_are_kept_per_variant() {
        let mut slots = PreparedSlots::default();
        assert_eq!(slots.get(Solver::HdsII), None);
        slots.insert(Solver::HdsII, KernelSlot(4));
        assert_eq!(slots.get(Solver::HdsII), Some(KernelSlot(4)));
        assert_eq!(slots.get(Solver::HdsI), None);
        assert_eq!(slots.get(Solver::HdsIII), None);
    }
}
