//! Proof-of-work variants and fork-height based selection.

use std::fmt;

use blake2::Blake2bMac;
use blake2::digest::Mac;
use blake2::digest::consts::U32;
use serde::{Deserialize, Serialize};

/// Height value used while a height is not known yet.
pub const UNKNOWN_HEIGHT: u64 = u64::MAX;

/// One of the three proof-of-work algorithms a job can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolverVariant {
    /// HdsHash I, before the first fork.
    HdsI,
    /// HdsHash II, between the first and second fork.
    HdsII,
    /// HdsHash III, after the second fork.
    HdsIII,
}

impl SolverVariant {
    /// All variants in fork order.
    pub const ALL: [SolverVariant; 3] = [Self::HdsI, Self::HdsII, Self::HdsIII];

    /// Position in [`Self::ALL`].
    pub fn ordinal(self) -> usize {
        match self {
            Self::HdsI => 0,
            Self::HdsII => 1,
            Self::HdsIII => 2,
        }
    }
}

impl fmt::Display for SolverVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HdsI => "HdsHash I",
            Self::HdsII => "HdsHash II",
            Self::HdsIII => "HdsHash III",
        };
        f.write_str(name)
    }
}

/// Pick the variant for a job.
///
/// A forced variant always wins. While the block height is unknown the
/// pre-fork variant is used.
pub fn select_variant(
    forced: Option<SolverVariant>,
    block_height: u64,
    fork_height: u64,
    fork_height2: u64,
) -> SolverVariant {
    if let Some(forced) = forced {
        return forced;
    }
    if block_height == UNKNOWN_HEIGHT || block_height < fork_height {
        return SolverVariant::HdsI;
    }
    if block_height < fork_height2 {
        return SolverVariant::HdsII;
    }
    SolverVariant::HdsIII
}

const HDS_III_PERSONAL_TAG: &[u8; 8] = b"Hds--PoW";
const HDS_III_N: u32 = 448;
const HDS_III_K: u32 = 5;

fn hds_iii_personalization() -> [u8; 16] {
    let mut personal = [0u8; 16];
    personal[..8].copy_from_slice(HDS_III_PERSONAL_TAG);
    personal[8..12].copy_from_slice(&HDS_III_N.to_le_bytes());
    personal[12..].copy_from_slice(&HDS_III_K.to_le_bytes());
    personal
}

/// Variant III header preprocessing: a personalised BLAKE2b-256 over
/// `header || nonce || extra_nonce`.
pub fn hds_iii_header(header: &[u8; 32], nonce: &[u8; 8], extra_nonce: &[u8; 4]) -> [u8; 32] {
    // Empty key and salt with a 16-byte persona are always valid parameters.
    let personal = hds_iii_personalization();
    let Ok(mut mac) = Blake2bMac::<U32>::new_with_salt_and_personal(&[], &[], &personal) else {
        unreachable!("blake2b parameters are fixed and valid");
    };
    mac.update(header);
    mac.update(nonce);
    mac.update(extra_nonce);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_heights_select_variants() {
        assert_eq!(select_variant(None, 50, 100, 200), SolverVariant::HdsI);
        assert_eq!(select_variant(None, 99, 100, 200), SolverVariant::HdsI);
        assert_eq!(select_variant(None, 100, 100, 200), SolverVariant::HdsII);
        assert_eq!(select_variant(None, 150, 100, 200), SolverVariant::HdsII);
        assert_eq!(select_variant(None, 200, 100, 200), SolverVariant::HdsIII);
        assert_eq!(select_variant(None, 250, 100, 200), SolverVariant::HdsIII);
    }

    #[test]
    fn forced_variant_wins() {
        for height in [0, 50, 150, 250, UNKNOWN_HEIGHT] {
            for forced in SolverVariant::ALL {
                assert_eq!(select_variant(Some(forced), height, 100, 200), forced);
            }
        }
    }

    #[test]
    fn unknown_heights_fall_back_to_first_variant() {
        assert_eq!(
            select_variant(None, UNKNOWN_HEIGHT, UNKNOWN_HEIGHT, UNKNOWN_HEIGHT),
            SolverVariant::HdsI
        );
        assert_eq!(select_variant(None, UNKNOWN_HEIGHT, 100, 200), SolverVariant::HdsI);
        assert_eq!(select_variant(None, 500, UNKNOWN_HEIGHT, UNKNOWN_HEIGHT), SolverVariant::HdsI);
        assert_eq!(select_variant(None, 500, 100, UNKNOWN_HEIGHT), SolverVariant::HdsII);
    }

    #[test]
    fn hds_iii_header_matches_reference_digest() {
        let nonce = [0, 1, 2, 3, 4, 5, 6, 7];
        let extra = [0xA1, 0xB2, 0xC3, 0xD4];
        assert_eq!(
            hex::encode(hds_iii_header(&[7; 32], &nonce, &extra)),
            "85a9a3924febba16e2a005286d5f0c9df92d6f52f22c74d23129f8766fcfc196"
        );
        assert_eq!(
            hex::encode(hds_iii_header(&[0; 32], &[0; 8], &[0; 4])),
            "af13db14e7995f210949e03e0765f3bc2877f4017645b1968feddb1c6338a13e"
        );
    }

    #[test]
    fn hds_iii_header_depends_on_every_input() {
        let header = [7u8; 32];
        let base = hds_iii_header(&header, &[1; 8], &[0; 4]);
        assert_ne!(base, header);
        assert_eq!(base, hds_iii_header(&header, &[1; 8], &[0; 4]));
        assert_ne!(base, hds_iii_header(&header, &[2; 8], &[0; 4]));
        assert_ne!(base, hds_iii_header(&header, &[1; 8], &[1; 4]));
        assert_ne!(base, hds_iii_header(&[8; 32], &[1; 8], &[0; 4]));
    }

    #[test]
    fn personalization_layout() {
        let personal = hds_iii_personalization();
        assert_eq!(&personal[..8], b"Hds--PoW");
        assert_eq!(&personal[8..12], &[0xC0, 0x01, 0, 0]);
        assert_eq!(&personal[12..], &[5, 0, 0, 0]);
    }
}
