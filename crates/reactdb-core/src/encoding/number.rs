use crate::error::EncodingError;

/// Width of an encoded number in characters.
pub const NUMBER_WIDTH: usize = 16;

/// Encode an f64 into 16 lowercase hex characters that preserve numeric
/// ordering under plain string comparison.
///
/// The 64-bit pattern is transformed so that unsigned comparison matches
/// numeric comparison:
/// 1. Reject NaN and normalize -0.0 to +0.0.
/// 2. Negative values flip all bits; positive values flip only the sign bit.
/// 3. Write the result big-endian, zero-padded to a fixed width.
pub fn encode_number(value: f64) -> Result<String, EncodingError> {
    if value.is_nan() {
        return Err(EncodingError::NaN);
    }

    let value = if value == 0.0 { 0.0_f64 } else { value };

    let mut bits = value.to_bits();
    if bits & (1u64 << 63) != 0 {
        bits = !bits;
    } else {
        bits ^= 1u64 << 63;
    }

    Ok(format!("{bits:016x}"))
}
