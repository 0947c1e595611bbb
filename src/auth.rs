//! HMAC-SHA256 request authentication (§4.3).
//!
//! The authenticator verifies against the **exact wire bytes** of the
//! frame with the `"hmac":"…"` field textually removed, rather than a
//! re-serialization of the decoded payload. This sidesteps the
//! canonicalization hazard the spec calls out: both sides would
//! otherwise have to agree on key order.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{BrokerError, BrokerResult};

type HmacSha256 = Hmac<Sha256>;

/// Verify `line`'s `hmac` field against `secret`.
///
/// Never logs the supplied HMAC value; any structural problem (missing
/// field, non-string value, bad hex, wrong length, bad key) is folded
/// into [`BrokerError::AuthFailed`] rather than panicking.
pub fn verify(secret: &[u8], line: &[u8]) -> BrokerResult<()> {
    let (stripped, provided_hex) = strip_hmac_field(line).ok_or(BrokerError::AuthFailed)?;
    let provided = decode_hex(&provided_hex).ok_or(BrokerError::AuthFailed)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| BrokerError::AuthFailed)?;
    mac.update(&stripped);
    mac.verify_slice(&provided).map_err(|_| BrokerError::AuthFailed)
}

/// Compute the lowercase-hex HMAC a client would attach to `body` (the
/// frame bytes without an `hmac` field). Used by the reference client.
#[must_use]
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    encode_hex(&mac.finalize().into_bytes())
}

/// Find a top-level `"hmac":"<hex>"` member, returning the remaining
/// bytes (with that member and its separating comma excised) and the
/// raw hex string found as the value.
///
/// The request's `value` field is opaque, client-supplied JSON (§9
/// "dynamic JSON typing") and may itself contain a nested `"hmac"` key
/// or string value; only a `"hmac"` key at the top level of the frame
/// object may be stripped and verified against.
fn strip_hmac_field(line: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    const NEEDLE: &[u8] = b"\"hmac\"";
    let key_start = find_top_level_key(line, b"hmac")?;
    let mut cursor = key_start + NEEDLE.len();

    cursor = skip_ws(line, cursor);
    if line.get(cursor) != Some(&b':') {
        return None;
    }
    cursor += 1;
    cursor = skip_ws(line, cursor);
    if line.get(cursor) != Some(&b'"') {
        return None;
    }
    let value_start = cursor + 1;
    let mut i = value_start;
    while i < line.len() {
        match line[i] {
            b'\\' => i += 2,
            b'"' => break,
            _ => i += 1,
        }
    }
    if i >= line.len() {
        return None;
    }
    let value_end = i; // index of closing quote
    let member_end = value_end + 1;

    let hex_value = line[value_start..value_end].to_vec();

    // Include one adjacent comma so the remaining bytes stay valid JSON:
    // prefer trailing comma (hmac was not the last member), else a
    // leading one (hmac was the last member).
    let mut remove_start = key_start;
    let mut remove_end = member_end;
    let after = skip_ws(line, member_end);
    if line.get(after) == Some(&b',') {
        remove_end = after + 1;
    } else {
        let mut before = key_start;
        while before > 0 && line[before - 1].is_ascii_whitespace() {
            before -= 1;
        }
        if before > 0 && line[before - 1] == b',' {
            remove_start = before - 1;
        }
    }

    let mut remaining = Vec::with_capacity(line.len() - (remove_end - remove_start));
    remaining.extend_from_slice(&line[..remove_start]);
    remaining.extend_from_slice(&line[remove_end..]);
    Some((remaining, hex_value))
}

fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Scan `line` tracking object/array nesting depth and string state,
/// returning the byte offset of the opening quote of a `key` string
/// used as an object key (i.e. followed by `:`) at depth 1 — directly
/// inside the frame's top-level object, not nested inside a `value`.
fn find_top_level_key(line: &[u8], key: &[u8]) -> Option<usize> {
    let mut i = 0;
    let mut depth: i32 = 0;

    while i < line.len() {
        match line[i] {
            b'"' => {
                let string_start = i;
                let mut j = i + 1;
                while j < line.len() {
                    match line[j] {
                        b'\\' => j += 2,
                        b'"' => break,
                        _ => j += 1,
                    }
                }
                if j >= line.len() {
                    return None;
                }
                if depth == 1 && &line[string_start + 1..j] == key {
                    let after = skip_ws(line, j + 1);
                    if line.get(after) == Some(&b':') {
                        return Some(string_start);
                    }
                }
                i = j + 1;
            }
            b'{' | b'[' => {
                depth += 1;
                i += 1;
            }
            b'}' | b']' => {
                depth -= 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    None
}

fn decode_hex(hex: &[u8]) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks(2) {
        let hi = hex_digit(pair[0])?;
        let lo = hex_digit(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Some(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}
