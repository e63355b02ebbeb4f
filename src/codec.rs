//! Fixed serialization for record headers and secondary-index keys.
//!
//! Two formats only, per spec.md 4.1:
//!
//! - the **record header**: three signed 64-bit integers printed in
//!   decimal, space separated;
//! - the **time-key tuple**: a secondary-index key body, the time
//!   rendered in decimal zero-padded to 13 digits, one space, then the
//!   raw user-key bytes.
//!
//! Grounded on the shape of `caddy`'s `enterprise::cache::codec` module
//! (a small, independently testable codec type with its own
//! `#[cfg(test)]` block) but implementing fixed-width text encoding
//! instead of bincode, since that is what spec.md specifies.

use crate::error::{Result, ThumbError};

/// The integer representation of "never expires" (spec.md 4.1).
pub const SENTINEL_EXPIRY_MS: i64 = 0;

/// Width, in decimal digits, of a zero-padded millisecond timestamp.
pub const TIME_WIDTH: usize = 13;

/// A cache record's fixed fields, as stored in the Data row (spec.md 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Last access time, milliseconds since the epoch.
    pub access_time_ms: i64,
    /// Expiry time, milliseconds since the epoch, or [`SENTINEL_EXPIRY_MS`].
    pub expiry_time_ms: i64,
    /// `len(key) + len(value) + len(metadata)`.
    pub record_size: i64,
}

impl RecordHeader {
    /// Whether this header's expiry is the "never expires" sentinel.
    pub fn is_sentinel_expiry(&self) -> bool {
        self.expiry_time_ms == SENTINEL_EXPIRY_MS
    }

    /// Whether this header is expired as of `now_ms`. A sentinel expiry
    /// is never expired.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        !self.is_sentinel_expiry() && self.expiry_time_ms <= now_ms
    }

    /// Encode as `"<access> <expiry> <size>"`.
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{} {} {}",
            self.access_time_ms, self.expiry_time_ms, self.record_size
        )
        .into_bytes()
    }

    /// Parse a record header. Accepts leading whitespace; fails on
    /// malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ThumbError::StoreError(format!("non-utf8 record header: {e}")))?;
        let mut fields = text.trim_start().split_whitespace();
        let mut next = || {
            fields
                .next()
                .ok_or_else(|| ThumbError::StoreError("truncated record header".to_string()))
                .and_then(|s| {
                    s.parse::<i64>()
                        .map_err(|e| ThumbError::StoreError(format!("malformed record header: {e}")))
                })
        };
        let access_time_ms = next()?;
        let expiry_time_ms = next()?;
        let record_size = next()?;
        Ok(RecordHeader {
            access_time_ms,
            expiry_time_ms,
            record_size,
        })
    }
}

/// Zero-pad `time_ms` to [`TIME_WIDTH`] digits. `time_ms` is assumed
/// non-negative (milliseconds since the epoch); the fixed width is what
/// makes lexicographic index-key order equal numeric order.
pub fn zero_pad_time(time_ms: i64) -> String {
    format!("{:0width$}", time_ms, width = TIME_WIDTH)
}

/// Build a secondary-index key body: `<prefix><13-digit time> <user_key>`.
pub fn encode_time_key(prefix: u8, time_ms: i64, user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + TIME_WIDTH + 1 + user_key.len());
    out.push(prefix);
    out.extend_from_slice(zero_pad_time(time_ms).as_bytes());
    out.push(b' ');
    out.extend_from_slice(user_key);
    out
}

/// Split a secondary-index key (prefix byte already stripped) into its
/// embedded timestamp and user-key bytes.
pub fn decode_time_key(body: &[u8]) -> Result<(i64, &[u8])> {
    if body.len() < TIME_WIDTH + 1 || body[TIME_WIDTH] != b' ' {
        return Err(ThumbError::StoreError(
            "malformed time-index key".to_string(),
        ));
    }
    let time_str = std::str::from_utf8(&body[..TIME_WIDTH])
        .map_err(|e| ThumbError::StoreError(format!("non-utf8 time-index key: {e}")))?;
    let time_ms = time_str
        .parse::<i64>()
        .map_err(|e| ThumbError::StoreError(format!("malformed time-index key: {e}")))?;
    Ok((time_ms, &body[TIME_WIDTH + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = RecordHeader {
            access_time_ms: 1_700_000_000_123,
            expiry_time_ms: SENTINEL_EXPIRY_MS,
            record_size: 42,
        };
        let decoded = RecordHeader::decode(&h.encode()).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn header_decode_accepts_leading_whitespace() {
        let decoded = RecordHeader::decode(b"  10 0 5").unwrap();
        assert_eq!(
            decoded,
            RecordHeader {
                access_time_ms: 10,
                expiry_time_ms: 0,
                record_size: 5
            }
        );
    }

    #[test]
    fn header_decode_rejects_malformed_input() {
        assert!(RecordHeader::decode(b"10 0").is_err());
        assert!(RecordHeader::decode(b"abc 0 5").is_err());
        assert!(RecordHeader::decode(b"").is_err());
    }

    #[test]
    fn sentinel_expiry_never_expires() {
        let h = RecordHeader {
            access_time_ms: 0,
            expiry_time_ms: SENTINEL_EXPIRY_MS,
            record_size: 1,
        };
        assert!(!h.is_expired_at(i64::MAX));
    }

    #[test]
    fn non_sentinel_expiry_expires_at_or_after_its_time() {
        let h = RecordHeader {
            access_time_ms: 0,
            expiry_time_ms: 1000,
            record_size: 1,
        };
        assert!(!h.is_expired_at(999));
        assert!(h.is_expired_at(1000));
        assert!(h.is_expired_at(1001));
    }

    #[test]
    fn time_key_preserves_lexicographic_numeric_order() {
        let a = encode_time_key(b'D', 5, b"k1");
        let b = encode_time_key(b'D', 10, b"k0");
        assert!(a < b, "5ms key must sort before 10ms key");
    }

    #[test]
    fn time_key_round_trips_with_embedded_space_in_nothing_but_the_separator() {
        let key = encode_time_key(b'D', 1_234_567_890_123, b"some user key");
        let (time_ms, user_key) = decode_time_key(&key[1..]).unwrap();
        assert_eq!(time_ms, 1_234_567_890_123);
        assert_eq!(user_key, b"some user key");
    }

    #[test]
    fn decode_time_key_rejects_short_input() {
        assert!(decode_time_key(b"short").is_err());
    }
}
