//! Nonce layout, per-dispatch work snapshots and candidate evaluation.

use sha2::{Digest, Sha256};

use crate::difficulty::Difficulty;
use crate::solution::{CodecError, encode_solution};
use crate::variant::SolverVariant;

/// Work id meaning "no work available".
pub const NO_WORK: i64 = -1;

/// Longest pool nonce prefix that is honoured; longer prefixes are cut.
pub const MAX_NONCE_PREFIX: usize = 6;

/// An 8-byte nonce in wire byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Nonce(pub [u8; 8]);

impl Nonce {
    /// Build a nonce from the pool prefix and a local counter value.
    ///
    /// The first `p = min(prefix.len(), 6)` bytes are the prefix; the other
    /// `8 - p` bytes hold the low bytes of `counter`, little-endian.
    pub fn compose(prefix: &[u8], counter: u64) -> Self {
        let p = prefix.len().min(MAX_NONCE_PREFIX);
        let mut bytes = (counter << (8 * p)).to_le_bytes();
        bytes[..p].copy_from_slice(&prefix[..p]);
        Self(bytes)
    }

    /// Lowercase hex of the wire bytes, as submitted.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The wire bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

/// Consistent copy of the job fields needed for one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkSnapshot {
    /// Variant the job must be solved with.
    pub variant: SolverVariant,
    /// Pool work id, or [`NO_WORK`].
    pub work_id: i64,
    /// Nonce reserved for this dispatch.
    pub nonce: Nonce,
    /// Header handed to the solver (already prehashed for variant III).
    pub header: [u8; 32],
    /// Share difficulty.
    pub difficulty: Difficulty,
    /// Extra nonce appended to variant III solutions.
    pub extra_nonce: [u8; 4],
}

impl WorkSnapshot {
    /// Whether the snapshot carries a usable job.
    pub fn has_work(&self) -> bool {
        self.work_id >= 0
    }
}

/// SHA-256 of an encoded solution.
pub fn solution_hash(encoded: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(encoded));
    out
}

/// Encode `indices` for `snapshot` and check them against its difficulty.
///
/// Returns the encoded bytes when the target is reached, `None` when it is
/// not, and an error when the indices cannot be encoded.
pub fn evaluate_candidate(snapshot: &WorkSnapshot, indices: &[u32]) -> Result<Option<Vec<u8>>, CodecError> {
    let encoded = encode_solution(snapshot.variant, indices, &snapshot.extra_nonce)?;
    let hash = solution_hash(&encoded);
    if snapshot.difficulty.is_target_reached(&hash) {
        Ok(Some(encoded))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solution::SOLUTION_INDICES;

    fn snapshot(variant: SolverVariant, difficulty: u32) -> WorkSnapshot {
        WorkSnapshot {
            variant,
            work_id: 7,
            nonce: Nonce::compose(&[], 1),
            header: [3; 32],
            difficulty: Difficulty::from_packed(difficulty),
            extra_nonce: [0; 4],
        }
    }

    #[test]
    fn nonce_layout_puts_prefix_first() {
        let nonce = Nonce::compose(&[0xAA, 0xBB], 0x0102_0304);
        assert_eq!(nonce.0, [0xAA, 0xBB, 0x04, 0x03, 0x02, 0x01, 0x00, 0x00]);
        assert_eq!(nonce.to_hex(), "aabb040302010000");
    }

    #[test]
    fn nonce_without_prefix_is_little_endian_counter() {
        let nonce = Nonce::compose(&[], 0x1122_3344_5566_7788);
        assert_eq!(nonce.0, 0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn long_prefix_is_cut_to_six_bytes() {
        let nonce = Nonce::compose(&[1, 2, 3, 4, 5, 6, 7, 8], 0x0000_0000_0000_BEEF);
        assert_eq!(nonce.0, [1, 2, 3, 4, 5, 6, 0xEF, 0xBE]);
    }

    #[test]
    fn distinct_counters_give_distinct_nonces_under_prefix() {
        let prefix = [9, 9, 9];
        let a = Nonce::compose(&prefix, 41);
        let b = Nonce::compose(&prefix, 42);
        assert_ne!(a, b);
        assert_eq!(&a.0[..3], &prefix);
        assert_eq!(&b.0[..3], &prefix);
    }

    #[test]
    fn unit_difficulty_accepts_every_candidate() {
        let indices: Vec<u32> = (0..SOLUTION_INDICES as u32).collect();
        for variant in SolverVariant::ALL {
            let encoded = evaluate_candidate(&snapshot(variant, 0), &indices).unwrap().unwrap();
            assert_eq!(encoded.len(), 104);
        }
    }

    #[test]
    fn infinite_difficulty_rejects_candidates() {
        let indices: Vec<u32> = (0..SOLUTION_INDICES as u32).collect();
        let snap = snapshot(SolverVariant::HdsI, Difficulty::INF);
        assert_eq!(evaluate_candidate(&snap, &indices), Ok(None));
    }

    #[test]
    fn bad_candidates_surface_codec_errors() {
        let snap = snapshot(SolverVariant::HdsII, 0);
        assert!(matches!(
            evaluate_candidate(&snap, &[1, 2]),
            Err(CodecError::WrongIndexCount { .. })
        ));

        let mut wide = vec![0u32; SOLUTION_INDICES];
        wide[5] = u32::MAX;
        assert!(matches!(
            evaluate_candidate(&snap, &wide),
            Err(CodecError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn snapshot_without_work() {
        let mut snap = snapshot(SolverVariant::HdsI, 0);
        assert!(snap.has_work());
        snap.work_id = NO_WORK;
        assert!(!snap.has_work());
    }
}
