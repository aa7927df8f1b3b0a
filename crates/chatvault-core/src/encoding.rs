//! Hex and base64 helpers shared by the wire and key-record types

use crate::error::{ChatvaultError, ChatvaultResult};

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Lowercase hex encoding
pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

/// Decode a hex string into exactly `N` bytes
pub fn hex_decode_array<const N: usize>(s: &str) -> ChatvaultResult<[u8; N]> {
    if s.len() != N * 2 {
        return Err(ChatvaultError::Encoding(format!(
            "expected {} hex chars, got {}",
            N * 2,
            s.len()
        )));
    }
    let mut out = [0u8; N];
    for (i, pair) in s.as_bytes().chunks(2).enumerate() {
        let hi = hex_val(pair[0])?;
        let lo = hex_val(pair[1])?;
        out[i] = (hi << 4) | lo;
    }
    Ok(out)
}

fn hex_val(c: u8) -> ChatvaultResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(ChatvaultError::Encoding(format!(
            "invalid hex character '{}'",
            c as char
        ))),
    }
}

pub fn base64_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(data)
}

pub fn base64_decode(s: &str) -> ChatvaultResult<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD
        .decode(s)
        .map_err(|e| ChatvaultError::Encoding(format!("base64 decode: {e}")))
}

/// Decode base64 into exactly `N` bytes
pub fn base64_decode_array<const N: usize>(s: &str) -> ChatvaultResult<[u8; N]> {
    let bytes = base64_decode(s)?;
    bytes.as_slice().try_into().map_err(|_| {
        ChatvaultError::Encoding(format!("expected {N} bytes, got {}", bytes.len()))
    })
}
