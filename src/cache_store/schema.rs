//! Keyspace layout: the one-byte prefixes that multiplex Values, Data,
//! Metadata, and the two secondary indexes into a single sled tree
//! (spec.md 3.1, 6.1).

/// Raw value bytes: `A` + user-key.
pub const PREFIX_VALUE: u8 = b'A';
/// Record header (access-time, expiry-time, record-size): `B` + user-key.
pub const PREFIX_DATA: u8 = b'B';
/// Raw metadata bytes, present only if metadata was set: `C` + user-key.
pub const PREFIX_META: u8 = b'C';
/// ATime secondary index: `D` + 13-digit time + ` ` + user-key -> record-size.
pub const PREFIX_ATIME: u8 = b'D';
/// ETime secondary index: `E` + 13-digit time + ` ` + user-key -> record-size.
pub const PREFIX_ETIME: u8 = b'E';
/// Persisted stats snapshot, reserved outside the user-key range.
pub const PREFIX_STATS: u8 = b'X';
/// Persisted settings, reserved outside the user-key range.
pub const PREFIX_SETTINGS: u8 = b'Y';

/// Settings key: persisted `max_size_in_bytes`.
pub const SETTINGS_MAX_SIZE: &[u8] = b"YMAX_SIZE";
/// Settings key: persisted discard policy (`0` = lru_only, `1` = lru_ttl).
pub const SETTINGS_POLICY: &[u8] = b"YPOLICY";
/// Settings key: schema version gate.
pub const SETTINGS_SCHEMA_VERSION: &[u8] = b"YSCHEMA_VERSION";
/// Stats snapshot key.
pub const STATS_VALUES_KEY: &[u8] = b"XVALUES";
/// Dirty flag: set on open, cleared on clean close. Begins with `!`, a
/// byte that sorts before every user-key prefix.
pub const DIRTY_FLAG_KEY: &[u8] = b"!dirty";

/// Current on-disk schema version (spec.md 6.1).
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

fn prefixed(prefix: u8, user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + user_key.len());
    out.push(prefix);
    out.extend_from_slice(user_key);
    out
}

pub fn value_key(user_key: &[u8]) -> Vec<u8> {
    prefixed(PREFIX_VALUE, user_key)
}

pub fn data_key(user_key: &[u8]) -> Vec<u8> {
    prefixed(PREFIX_DATA, user_key)
}

pub fn meta_key(user_key: &[u8]) -> Vec<u8> {
    prefixed(PREFIX_META, user_key)
}

pub fn atime_key(time_ms: i64, user_key: &[u8]) -> Vec<u8> {
    crate::codec::encode_time_key(PREFIX_ATIME, time_ms, user_key)
}

pub fn etime_key(time_ms: i64, user_key: &[u8]) -> Vec<u8> {
    crate::codec::encode_time_key(PREFIX_ETIME, time_ms, user_key)
}

/// Lower/upper bound pair spanning every key under a given one-byte
/// prefix, for range scans over the ATime/ETime indexes.
pub fn prefix_range(prefix: u8) -> (Vec<u8>, Vec<u8>) {
    (vec![prefix], vec![prefix + 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_range_spans_exactly_one_byte_value() {
        let (lo, hi) = prefix_range(PREFIX_ATIME);
        assert_eq!(lo, vec![PREFIX_ATIME]);
        assert_eq!(hi, vec![PREFIX_ATIME + 1]);
    }

    #[test]
    fn dirty_flag_sorts_before_every_table_prefix() {
        for prefix in [
            PREFIX_VALUE,
            PREFIX_DATA,
            PREFIX_META,
            PREFIX_ATIME,
            PREFIX_ETIME,
            PREFIX_STATS,
            PREFIX_SETTINGS,
        ] {
            assert!(DIRTY_FLAG_KEY[0] < prefix);
        }
    }
}
