//! Wire encodings for solver output.

use thiserror::Error;

use crate::variant::SolverVariant;

/// Number of indices in every solution produced by the solvers.
pub const SOLUTION_INDICES: usize = 32;

/// Collision bit length used by the pre-fork solvers (indices are 26 bits wide).
pub const PRE_FORK_C_BIT_LEN: usize = 25;

/// Length of the packed variant III solution, without the extra nonce.
pub const HDS_III_PACKED_LEN: usize = 100;

/// Errors returned when a candidate cannot be encoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The solver returned the wrong number of indices.
    #[error("expected {expected} indices, got {got}")]
    WrongIndexCount {
        /// Required index count.
        expected: usize,
        /// Index count received.
        got: usize,
    },

    /// An index does not fit into the encoding width.
    #[error("index {index:#x} does not fit into {bit_len} bits")]
    IndexOutOfRange {
        /// Offending index.
        index: u32,
        /// Encoding width in bits.
        bit_len: usize,
    },

    /// The encoding width is outside `8..=32` bits.
    #[error("unsupported index width of {0} bits")]
    UnsupportedBitLength(usize),

    /// The encoded buffer is shorter than the requested index count needs.
    #[error("encoded solution truncated: need {needed} bytes, got {got}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        got: usize,
    },
}

fn index_width(c_bit_len: usize) -> Result<usize, CodecError> {
    let bit_len = c_bit_len + 1;
    if !(8..=32).contains(&bit_len) {
        return Err(CodecError::UnsupportedBitLength(bit_len));
    }
    Ok(bit_len)
}

/// Pack indices into the minimal big-endian bit stream.
///
/// Every index occupies `c_bit_len + 1` bits. The output is
/// `ceil((c_bit_len + 1) * n / 8)` bytes.
///
/// Padding goes at the tail of the stream, not the head: a partial last byte
/// keeps its data in the high-order bits and is zero-filled in its low-order
/// bits. This is the layout the pool expands solutions with. A full
/// 32-index solution at the pre-fork width (26 bits) is 832 bits, so
/// submitted solutions never carry padding.
pub fn pack_minimal(indices: &[u32], c_bit_len: usize) -> Result<Vec<u8>, CodecError> {
    let bit_len = index_width(c_bit_len)?;
    let mut out = Vec::with_capacity((bit_len * indices.len()).div_ceil(8));

    let mut acc: u64 = 0;
    let mut acc_bits = 0usize;
    for &index in indices {
        if bit_len < 32 && index >> bit_len != 0 {
            return Err(CodecError::IndexOutOfRange { index, bit_len });
        }
        acc = (acc << bit_len) | u64::from(index);
        acc_bits += bit_len;
        while acc_bits >= 8 {
            acc_bits -= 8;
            out.push((acc >> acc_bits) as u8);
        }
        acc &= (1u64 << acc_bits) - 1;
    }
    if acc_bits > 0 {
        out.push((acc << (8 - acc_bits)) as u8);
    }
    Ok(out)
}

/// Inverse of [`pack_minimal`]: read `count` indices of `c_bit_len + 1` bits.
pub fn unpack_minimal(bytes: &[u8], c_bit_len: usize, count: usize) -> Result<Vec<u32>, CodecError> {
    let bit_len = index_width(c_bit_len)?;
    let needed = (bit_len * count).div_ceil(8);
    if bytes.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            got: bytes.len(),
        });
    }

    let mask = (1u64 << bit_len) - 1;
    let mut out = Vec::with_capacity(count);
    let mut acc: u64 = 0;
    let mut acc_bits = 0usize;
    for &byte in &bytes[..needed] {
        acc = (acc << 8) | u64::from(byte);
        acc_bits += 8;
        while acc_bits >= bit_len && out.len() < count {
            acc_bits -= bit_len;
            out.push(((acc >> acc_bits) & mask) as u32);
        }
        acc &= (1u64 << acc_bits) - 1;
    }
    Ok(out)
}

/// Word ranges of the variant III layout, least significant first.
/// `(first, last, truncated_to_16_bits)`.
const HDS_III_LAYOUT: [(usize, usize, bool); 4] =
    [(0, 11, false), (12, 12, true), (16, 27, false), (28, 28, true)];

/// Pack a 32-word variant III solution into its 800-bit layout, followed by
/// the 4 extra-nonce bytes.
pub fn pack_hds_iii(words: &[u32], extra_nonce: &[u8; 4]) -> Result<Vec<u8>, CodecError> {
    if words.len() != SOLUTION_INDICES {
        return Err(CodecError::WrongIndexCount {
            expected: SOLUTION_INDICES,
            got: words.len(),
        });
    }

    let mut out = Vec::with_capacity(HDS_III_PACKED_LEN + extra_nonce.len());
    for (first, last, truncated) in HDS_III_LAYOUT {
        for &word in &words[first..=last] {
            if truncated {
                out.extend_from_slice(&(word as u16).to_le_bytes());
            } else {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
    }
    debug_assert_eq!(out.len(), HDS_III_PACKED_LEN);
    out.extend_from_slice(extra_nonce);
    Ok(out)
}

/// Recover the 32 words from a packed variant III solution. Words that are not
/// part of the layout come back as zero.
pub fn unpack_hds_iii(bytes: &[u8]) -> Result<Vec<u32>, CodecError> {
    if bytes.len() < HDS_III_PACKED_LEN {
        return Err(CodecError::Truncated {
            needed: HDS_III_PACKED_LEN,
            got: bytes.len(),
        });
    }

    let mut words = vec![0u32; SOLUTION_INDICES];
    let mut pos = 0;
    for (first, last, truncated) in HDS_III_LAYOUT {
        for word in &mut words[first..=last] {
            if truncated {
                *word = u32::from(u16::from_le_bytes([bytes[pos], bytes[pos + 1]]));
                pos += 2;
            } else {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&bytes[pos..pos + 4]);
                *word = u32::from_le_bytes(raw);
                pos += 4;
            }
        }
    }
    Ok(words)
}

/// Encode solver output for submission according to the job's variant.
pub fn encode_solution(
    variant: SolverVariant,
    indices: &[u32],
    extra_nonce: &[u8; 4],
) -> Result<Vec<u8>, CodecError> {
    match variant {
        SolverVariant::HdsI | SolverVariant::HdsII => {
            if indices.len() != SOLUTION_INDICES {
                return Err(CodecError::WrongIndexCount {
                    expected: SOLUTION_INDICES,
                    got: indices.len(),
                });
            }
            pack_minimal(indices, PRE_FORK_C_BIT_LEN)
        }
        SolverVariant::HdsIII => pack_hds_iii(indices, extra_nonce),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_indices(bits: u32) -> Vec<u32> {
        let mask = if bits == 32 { u32::MAX } else { (1 << bits) - 1 };
        (0..SOLUTION_INDICES as u32)
            .map(|i| i.wrapping_mul(0x9E37_79B9).rotate_left(i) & mask)
            .collect()
    }

    #[test]
    fn minimal_encoding_round_trips_across_widths() {
        for c_bit_len in [7usize, 11, 20, 25, 31] {
            let indices = sample_indices(c_bit_len as u32 + 1);
            for n in [1usize, 3, 7, 32] {
                let packed = pack_minimal(&indices[..n], c_bit_len).unwrap();
                assert_eq!(packed.len(), ((c_bit_len + 1) * n).div_ceil(8));
                let unpacked = unpack_minimal(&packed, c_bit_len, n).unwrap();
                assert_eq!(unpacked, &indices[..n], "c_bit_len={c_bit_len} n={n}");
            }
        }
    }

    #[test]
    fn minimal_encoding_is_big_endian_with_tail_padding() {
        // Two 9-bit values: 1_0000_0001 and 0_1111_1111 -> 18 bits, 3 bytes.
        let packed = pack_minimal(&[0x101, 0x0FF], 8).unwrap();
        assert_eq!(packed, vec![0b1000_0000, 0b1011_1111, 0b1100_0000]);
        assert_eq!(unpack_minimal(&packed, 8, 2).unwrap(), vec![0x101, 0x0FF]);

        // A single 26-bit index leaves 6 pad bits at the end, never the start.
        let packed = pack_minimal(&[(1 << 26) - 1], PRE_FORK_C_BIT_LEN).unwrap();
        assert_eq!(packed, vec![0xFF, 0xFF, 0xFF, 0b1100_0000]);
    }

    #[test]
    fn pre_fork_solution_is_104_bytes() {
        let indices = sample_indices(26);
        let encoded = encode_solution(SolverVariant::HdsI, &indices, &[0; 4]).unwrap();
        assert_eq!(encoded.len(), 104);
        assert_eq!(encoded, pack_minimal(&indices, PRE_FORK_C_BIT_LEN).unwrap());
    }

    #[test]
    fn minimal_encoding_rejects_bad_input() {
        assert_eq!(
            pack_minimal(&[1 << 26], PRE_FORK_C_BIT_LEN),
            Err(CodecError::IndexOutOfRange {
                index: 1 << 26,
                bit_len: 26
            })
        );
        assert_eq!(pack_minimal(&[1], 6), Err(CodecError::UnsupportedBitLength(7)));
        assert!(matches!(
            unpack_minimal(&[0u8; 3], PRE_FORK_C_BIT_LEN, 2),
            Err(CodecError::Truncated { needed: 7, got: 3 })
        ));
        assert_eq!(
            encode_solution(SolverVariant::HdsII, &[1, 2, 3], &[0; 4]),
            Err(CodecError::WrongIndexCount {
                expected: 32,
                got: 3
            })
        );
    }

    #[test]
    fn hds_iii_packing_round_trips_and_appends_extra_nonce() {
        let mut words = sample_indices(32);
        words[12] &= 0xFFFF;
        words[28] &= 0xFFFF;
        for unused in [13, 14, 15, 29, 30, 31] {
            words[unused] = 0;
        }

        let extra_nonce = [0xA1, 0xB2, 0xC3, 0xD4];
        let packed = pack_hds_iii(&words, &extra_nonce).unwrap();
        assert_eq!(packed.len(), HDS_III_PACKED_LEN + 4);
        assert_eq!(&packed[100..], &extra_nonce);
        assert_eq!(unpack_hds_iii(&packed).unwrap(), words);
    }

    #[test]
    fn hds_iii_layout_matches_accumulator_order() {
        let mut words = vec![0u32; SOLUTION_INDICES];
        words[0] = 0x0403_0201;
        words[11] = 0xDDCC_BBAA;
        words[12] = 0xFFFF_1234;
        words[16] = 0x0807_0605;
        words[28] = 0xABCD_5678;
        words[31] = 0xFFFF_FFFF;

        let packed = pack_hds_iii(&words, &[0; 4]).unwrap();
        assert_eq!(&packed[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&packed[44..48], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&packed[48..50], &[0x34, 0x12]);
        assert_eq!(&packed[50..54], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&packed[98..100], &[0x78, 0x56]);
    }

    #[test]
    fn hds_iii_requires_32_words() {
        assert!(matches!(
            encode_solution(SolverVariant::HdsIII, &[0; 31], &[0; 4]),
            Err(CodecError::WrongIndexCount { expected: 32, got: 31 })
        ));
        assert!(matches!(
            unpack_hds_iii(&[0; 99]),
            Err(CodecError::Truncated { .. })
        ));
    }
}
