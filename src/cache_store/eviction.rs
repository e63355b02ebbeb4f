//! The eviction algorithm shared by `put`, `put_metadata`, and `trim_to`
//! (spec.md 4.3).
//!
//! Two passes, TTL first then LRU, walking the respective secondary
//! index in ascending (oldest-first) order and queuing deletions into a
//! single [`sled::Batch`] that the caller commits atomically alongside
//! its own mutation — this is what keeps "evict room, then insert" a
//! single crash-safe write.

use sled::Db;

use crate::codec::{decode_time_key, RecordHeader};

use super::schema::{self, PREFIX_ATIME, PREFIX_ETIME};
use super::Policy;
use crate::error::Result;

/// One entry removed by an eviction pass, for stats bookkeeping and
/// event dispatch.
pub struct Evicted {
    pub user_key: Vec<u8>,
    pub record_size: u64,
    pub via_ttl: bool,
}

/// Result of running the eviction algorithm.
#[derive(Default)]
pub struct EvictionOutcome {
    pub batch: sled::Batch,
    pub evicted: Vec<Evicted>,
}

impl EvictionOutcome {
    pub fn bytes_freed(&self) -> i64 {
        self.evicted.iter().map(|e| e.record_size as i64).sum()
    }
}

/// Free at least `bytes_needed` bytes, excluding `exclude_key` (the
/// entry currently being inserted or updated, if any) from consideration.
///
/// Under [`Policy::LruTtl`], first drains every currently-expired entry
/// from the ETime index regardless of whether that alone meets
/// `bytes_needed` (spec.md 4.3: "the TTL pass always drains all
/// currently-expired entries before any LRU pass begins"). If bytes are
/// still owed, walks the ATime index oldest-first.
pub fn evict(
    db: &Db,
    policy: Policy,
    now_ms: i64,
    bytes_needed: i64,
    exclude_key: Option<&[u8]>,
) -> Result<EvictionOutcome> {
    let mut outcome = EvictionOutcome::default();
    if bytes_needed <= 0 {
        return Ok(outcome);
    }
    let mut remaining = bytes_needed;

    if policy == Policy::LruTtl {
        let (lo, hi) = schema::prefix_range(PREFIX_ETIME);
        for item in db.range(lo..hi) {
            let (index_key, _) = item?;
            let (time_ms, user_key) = decode_time_key(&index_key[1..])?;
            if time_ms > now_ms {
                break;
            }
            if exclude_key == Some(user_key) {
                continue;
            }
            let user_key = user_key.to_vec();
            let header = match db.get(schema::data_key(&user_key))? {
                Some(raw) => RecordHeader::decode(&raw)?,
                None => continue, // index row without a Data row: already gone.
            };
            queue_delete(&mut outcome.batch, &user_key, &header);
            remaining -= header.record_size;
            outcome.evicted.push(Evicted {
                user_key,
                record_size: header.record_size as u64,
                via_ttl: true,
            });
        }
    }

    if remaining > 0 {
        let (lo, hi) = schema::prefix_range(PREFIX_ATIME);
        for item in db.range(lo..hi) {
            if remaining <= 0 {
                break;
            }
            let (index_key, _) = item?;
            let (_time_ms, user_key) = decode_time_key(&index_key[1..])?;
            if exclude_key == Some(user_key) {
                continue;
            }
            if outcome.evicted.iter().any(|e| e.user_key == user_key) {
                continue; // already queued by the TTL pass
            }
            let user_key = user_key.to_vec();
            let header = match db.get(schema::data_key(&user_key))? {
                Some(raw) => RecordHeader::decode(&raw)?,
                None => continue,
            };
            queue_delete(&mut outcome.batch, &user_key, &header);
            remaining -= header.record_size;
            outcome.evicted.push(Evicted {
                user_key,
                record_size: header.record_size as u64,
                via_ttl: false,
            });
        }
    }

    Ok(outcome)
}

fn queue_delete(batch: &mut sled::Batch, user_key: &[u8], header: &RecordHeader) {
    batch.remove(schema::value_key(user_key));
    batch.remove(schema::data_key(user_key));
    batch.remove(schema::meta_key(user_key));
    batch.remove(schema::atime_key(header.access_time_ms, user_key));
    if !header.is_sentinel_expiry() {
        batch.remove(schema::etime_key(header.expiry_time_ms, user_key));
    }
}
