//! Compact difficulty representation and target check.
//!
//! A packed difficulty stores an 8-bit order and a 24-bit mantissa (with an
//! implicit leading bit). The raw difficulty is `mantissa << order`, where a
//! raw value of `2^24` is difficulty 1.0. A hash reaches the difficulty when
//! `hash * raw < 2^280`, i.e. when the hash is at most
//! `floor((2^280 - 1) / raw)`.

use primitive_types::{U256, U512};
use serde::{Deserialize, Serialize};

const MANTISSA_BITS: u32 = 24;
const MAX_ORDER: u32 = 256 - MANTISSA_BITS - 1;

/// Bit width of the normalised product `hash * raw`.
const TARGET_BITS: usize = 256 + MANTISSA_BITS as usize;

/// Packed proof-of-work difficulty as sent by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Difficulty(u32);

impl Difficulty {
    /// Packed value that stands for "infinite" difficulty.
    pub const INF: u32 = (MAX_ORDER + 1) << MANTISSA_BITS;

    /// Wrap a packed difficulty value.
    pub const fn from_packed(packed: u32) -> Self {
        Self(packed)
    }

    /// The packed value.
    pub const fn packed(self) -> u32 {
        self.0
    }

    fn unpack(self) -> (u32, u32) {
        let order = self.0 >> MANTISSA_BITS;
        let leading = 1u32 << MANTISSA_BITS;
        let mantissa = leading | (self.0 & (leading - 1));
        (order, mantissa)
    }

    /// Raw difficulty, or `None` for packed values above [`Self::INF`].
    pub fn raw(self) -> Option<U256> {
        if self.0 > Self::INF {
            return None;
        }
        if self.0 == Self::INF {
            return Some(U256::MAX);
        }
        let (order, mantissa) = self.unpack();
        Some(U256::from(mantissa) << order as usize)
    }

    /// The largest hash value (big-endian integer) that reaches this difficulty.
    pub fn target(self) -> Option<U512> {
        let raw = U512::from(self.raw()?);
        let limit = (U512::one() << TARGET_BITS) - U512::one();
        Some(limit / raw)
    }

    /// Whether `hash`, read as an unsigned big-endian integer, reaches the target.
    pub fn is_target_reached(self, hash: &[u8; 32]) -> bool {
        let Some(target) = self.target() else {
            return false;
        };
        U512::from(U256::from_big_endian(hash)) <= target
    }

    /// Difficulty as a floating point number, for display only.
    pub fn to_float(self) -> f64 {
        if self.0 >= Self::INF {
            return f64::INFINITY;
        }
        let (order, mantissa) = self.unpack();
        f64::from(mantissa) * 2f64.powi(order as i32 - MANTISSA_BITS as i32)
    }
}

impl From<u32> for Difficulty {
    fn from(packed: u32) -> Self {
        Self(packed)
    }
}
