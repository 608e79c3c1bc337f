//! CRC-16/MODBUS checksums as used by the ring firmware
//!
//! Register starts at `0xFFFF`, reflected polynomial `0xA001`. The checksum
//! covers the frame from a variant-specific start offset to the end, which is
//! how the firmware skips its own opcode and CRC bytes.
//!
//! ```rust
//! use ring_core::crc;
//!
//! let mut frame = vec![0x24, 0, 0, 0x05, 0x0a];
//! crc::seal(&mut frame, 1, 2, 3);
//! assert!(crc::verify(&frame, 1, 2, 3));
//! ```

use crate::error::{Result, RingError};

/// Reflected generator polynomial
pub const POLYNOMIAL: u16 = 0xA001;

/// Initial register value
pub const INITIAL: u16 = 0xFFFF;

/// Compute the checksum over `bytes[start_offset..]`
///
/// An offset past the end yields the untouched initial register.
pub fn compute(bytes: &[u8], start_offset: usize) -> u16 {
    let covered = bytes.get(start_offset..).unwrap_or(&[]);
    covered.iter().fold(INITIAL, |register, &byte| {
        let mut register = register ^ u16::from(byte);
        for _ in 0..8 {
            register = if register & 0x0001 != 0 {
                (register >> 1) ^ POLYNOMIAL
            } else {
                register >> 1
            };
        }
        register
    })
}

/// Read the checksum embedded at `low_index`/`high_index`
pub fn embedded(frame: &[u8], low_index: usize, high_index: usize) -> Option<u16> {
    let low = *frame.get(low_index)?;
    let high = *frame.get(high_index)?;
    Some(u16::from_le_bytes([low, high]))
}

/// Check the embedded checksum against one recomputed from `start_offset`
///
/// A frame too short to hold the CRC bytes and the start of the covered range
/// is [`RingError::Truncated`]; a wrong checksum is [`RingError::CrcMismatch`].
pub fn check(frame: &[u8], low_index: usize, high_index: usize, start_offset: usize) -> Result<()> {
    let needed = (low_index.max(high_index) + 1).max(start_offset);
    let carried = match embedded(frame, low_index, high_index) {
        Some(carried) if frame.len() >= needed => carried,
        _ => {
            return Err(RingError::Truncated {
                needed,
                available: frame.len(),
            })
        }
    };
    let expected = compute(frame, start_offset);
    if carried != expected {
        return Err(RingError::CrcMismatch {
            expected,
            actual: carried,
        });
    }
    Ok(())
}

/// Boolean form of [`check`]
///
/// Returns false (never panics) when the CRC indices fall outside the frame.
/// Disposal of a failing frame is the caller's decision.
pub fn verify(frame: &[u8], low_index: usize, high_index: usize, start_offset: usize) -> bool {
    check(frame, low_index, high_index, start_offset).is_ok()
}

/// Write the checksum of `frame[start_offset..]` into the CRC bytes
///
/// The CRC bytes must lie before `start_offset`, otherwise the written value
/// would invalidate itself.
pub fn seal(frame: &mut [u8], low_index: usize, high_index: usize, start_offset: usize) {
    debug_assert!(low_index < start_offset && high_index < start_offset);
    let [low, high] = compute(frame, start_offset).to_le_bytes();
    if let Some(slot) = frame.get_mut(low_index) {
        *slot = low;
    }
    if let Some(slot) = frame.get_mut(high_index) {
        *slot = high;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    #[test]
    fn test_modbus_check_value() {
        assert_eq!(compute(b"123456789", 0), 0x4B37);
    }

    #[test]
    fn test_offset_skips_header() {
        let frame = [0xAA, 0x55, 0x00, 0x00, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9'];
        assert_eq!(compute(&frame, 4), 0x4B37);
    }

    #[test]
    fn test_empty_range_is_initial() {
        assert_eq!(compute(&[], 0), INITIAL);
        assert_eq!(compute(&[1, 2, 3], 3), INITIAL);
        assert_eq!(compute(&[1, 2, 3], 10), INITIAL);
    }

    #[test]
    fn test_verify_out_of_range_indices() {
        assert!(!verify(&[0x19], 1, 2, 3));
    }

    #[test]
    fn test_check_reports_truncation() {
        let err = check(&[0x19, 0x00], 1, 2, 3).unwrap_err();
        assert!(matches!(err, RingError::Truncated { needed: 3, available: 2 }));
        assert_eq!(err.error_code(), "TRUNCATED_FRAME");
    }

    #[test]
    fn test_check_reports_both_checksums() {
        let mut frame = vec![0x1B, 0, 0, 0x01, 0x02];
        seal(&mut frame, 1, 2, 3);
        let sealed = compute(&frame, 3);
        assert!(check(&frame, 1, 2, 3).is_ok());

        frame[4] ^= 0x10;
        match check(&frame, 1, 2, 3) {
            Err(RingError::CrcMismatch { expected, actual }) => {
                assert_eq!(actual, sealed);
                assert_eq!(expected, compute(&frame, 3));
                assert_ne!(expected, actual);
            }
            other => panic!("expected a CRC mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_seal_then_verify() {
        let mut frame = vec![0x1B, 0, 0, 0x01, 0x01, 0, 0, 0];
        seal(&mut frame, 1, 2, 3);
        assert!(verify(&frame, 1, 2, 3));
        assert_eq!(embedded(&frame, 1, 2), Some(compute(&frame, 3)));
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let len = rng.gen_range(5..64);
            let mut frame: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            seal(&mut frame, 1, 2, 3);
            assert!(verify(&frame, 1, 2, 3));

            let byte = rng.gen_range(3..len);
            let bit = rng.gen_range(0..8);
            frame[byte] ^= 1 << bit;
            assert!(!verify(&frame, 1, 2, 3), "flip at byte {byte} bit {bit} went unnoticed");
        }
    }
}
