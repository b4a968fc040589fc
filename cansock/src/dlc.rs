//! Frame-length codec
//!
//! Converts between a payload length in bytes and the 4-bit data length code
//! (DLC) used on the wire by CAN FD. Codes 0..=8 map one to one; codes
//! 9..=15 stand for 12, 16, 20, 24, 32, 48 and 64 bytes.

/// Largest data length code
pub const MAX_DLC: u8 = 15;

/// Largest payload of an FD frame
pub const MAX_FD_LEN: usize = 64;

const DLC_TO_LEN: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

#[rustfmt::skip]
const LEN_TO_DLC: [u8; 65] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8,          // 0 - 8
    9, 9, 9, 9,                         // 9 - 12
    10, 10, 10, 10,                     // 13 - 16
    11, 11, 11, 11,                     // 17 - 20
    12, 12, 12, 12,                     // 21 - 24
    13, 13, 13, 13, 13, 13, 13, 13,     // 25 - 32
    14, 14, 14, 14, 14, 14, 14, 14,     // 33 - 40
    14, 14, 14, 14, 14, 14, 14, 14,     // 41 - 48
    15, 15, 15, 15, 15, 15, 15, 15,     // 49 - 56
    15, 15, 15, 15, 15, 15, 15, 15,     // 57 - 64
];

/// Map a byte length to its data length code
///
/// Lengths 9..=64 round up to the next supported FD size. Anything above 64
/// maps to [`MAX_DLC`].
pub fn len_to_dlc(len: usize) -> u8 {
    LEN_TO_DLC.get(len).copied().unwrap_or(MAX_DLC)
}

/// Map a data length code back to its byte length
///
/// Only the low nibble is considered, so codes above [`MAX_DLC`] wrap into
/// the table instead of failing.
pub fn dlc_to_len(dlc: u8) -> usize {
    DLC_TO_LEN[(dlc & 0x0F) as usize] as usize
}

/// Round a byte length to a length that is representable on the wire
pub fn normalize_len(len: usize) -> usize {
    dlc_to_len(len_to_dlc(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_lengths_are_invertible() {
        for len in 0..=8 {
            assert_eq!(len_to_dlc(len) as usize, len);
            assert_eq!(normalize_len(len), len);
        }
    }

    #[test]
    fn test_fd_lengths_round_up() {
        const SIZES: [usize; 7] = [12, 16, 20, 24, 32, 48, 64];

        for len in 9..=MAX_FD_LEN {
            let expected = SIZES.iter().copied().find(|&s| s >= len).unwrap();
            assert_eq!(normalize_len(len), expected, "length {}", len);
        }
    }

    #[test]
    fn test_oversized_lengths() {
        assert_eq!(len_to_dlc(65), MAX_DLC);
        assert_eq!(len_to_dlc(usize::MAX), MAX_DLC);
        assert_eq!(normalize_len(200), MAX_FD_LEN);
    }

    #[test]
    fn test_dlc_uses_low_nibble() {
        assert_eq!(dlc_to_len(15), 64);
        assert_eq!(dlc_to_len(0x1F), 64);
        assert_eq!(dlc_to_len(0x19), 12);
    }
}
