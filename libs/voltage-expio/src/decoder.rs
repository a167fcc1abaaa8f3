//! Bit-level register decoding
//!
//! Digital words are unpacked LSB-first: bit 0 of the register is I/O index 1,
//! bit `length - 1` is index `length`. The ordering is fixed by the board
//! hardware and shared by DI, DO and LED registers.

/// Bits available in one holding register
pub const REGISTER_BITS: u8 = 16;

/// Extract single bit from u16 value
#[inline]
pub fn extract_bit_u16(value: u16, bit_index: u8) -> bool {
    debug_assert!(bit_index < 16, "Bit index out of range: {}", bit_index);
    (value & (1 << bit_index)) != 0
}

/// Unpack the low `length` bits of `word`, first element = I/O index 1
///
/// Lengths above 16 are clamped to the register width.
pub fn decode_bits(word: u16, length: u8) -> Vec<bool> {
    let length = length.min(REGISTER_BITS);
    (0..length).map(|bit| extract_bit_u16(word, bit)).collect()
}

/// Pack bits back into a register word (inverse of [`decode_bits`])
pub fn encode_bits(bits: &[bool]) -> u16 {
    bits.iter()
        .take(REGISTER_BITS as usize)
        .enumerate()
        .filter(|(_, set)| **set)
        .fold(0u16, |word, (bit, _)| word | (1 << bit))
}

/// Return `word` with bit `bit_index` set or cleared
#[inline]
pub fn with_bit(word: u16, bit_index: u8, value: bool) -> u16 {
    debug_assert!(bit_index < 16, "Bit index out of range: {}", bit_index);
    if value {
        word | (1 << bit_index)
    } else {
        word & !(1 << bit_index)
    }
}

/// Split a capability register into `(di_count, do_count)`
///
/// Low byte carries the digital-input count, high byte the digital-output count.
#[inline]
pub fn split_capability_word(word: u16) -> (u8, u8) {
    ((word & 0x00FF) as u8, (word >> 8) as u8)
}

/// Combine the two words of a pulse counter
///
/// The board reports counters as two words that are summed, not concatenated.
#[inline]
pub fn combine_counter(first: u16, second: u16) -> u32 {
    u32::from(first) + u32::from(second)
}
