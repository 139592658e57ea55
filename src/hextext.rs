//! Fixed width ASCII hexadecimal fields

use thiserror::Error;

/// Number of hex digits in a field
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Width {
    Byte = 2,
    Word = 4,
}

impl Width {
    pub fn digits(self) -> usize {
        self as usize
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum HexError {
    #[error("invalid hex digit {digit:?} at offset {index}")]
    InvalidDigit { digit: char, index: usize },

    #[error("expected {expected} hex digits, found {found}")]
    Truncated { expected: usize, found: usize },
}

/// Decode the first `width` characters of `s` as an unsigned big-endian value.
///
/// Characters after the field are ignored. Both upper and lower case digits are accepted.
pub fn decode_hex_digits(s: &[u8], width: Width) -> Result<u16, HexError> {
    let digits = width.digits();
    if s.len() < digits {
        return Err(HexError::Truncated { expected: digits, found: s.len() });
    }

    let mut bytes = [0u8; 2];
    let out = &mut bytes[..digits / 2];
    ::hex::decode_to_slice(&s[..digits], &mut *out).map_err(|e| match e {
        ::hex::FromHexError::InvalidHexCharacter { c, index } => HexError::InvalidDigit { digit: c, index },
        // Length is fixed above
        _ => HexError::Truncated { expected: digits, found: s.len() },
    })?;

    Ok(out.iter().fold(0u16, |acc, b| (acc << 8) | *b as u16))
}

pub fn decode_byte(s: &[u8]) -> Result<u8, HexError> {
    decode_hex_digits(s, Width::Byte).map(|v| v as u8)
}

pub fn decode_word(s: &[u8]) -> Result<u16, HexError> {
    decode_hex_digits(s, Width::Word)
}
