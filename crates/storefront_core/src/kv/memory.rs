//! Process-local `KvStore` used by tests, the CLI probe and single-node
//! deployments.
//!
//! # Invariants
//! - One mutex guards the whole keyspace, so every trait method is atomic
//!   with respect to every other call on the same store.
//! - Expiry is evaluated lazily against the injected clock on each access.
//! - Every `SWEEP_EVERY_WRITES` key-creating writes, all expired keys are
//!   dropped, so keys that are never read again (absence sentinels, past
//!   days' counters, abandoned locks) do not accumulate.

use super::{check_bitfield_width, KvError, KvResult, KvStore};
use crate::clock::{Clock, SystemClock};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

const MAX_BIT_OFFSET: u64 = u32::MAX as u64;
const SWEEP_EVERY_WRITES: u64 = 256;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Sorted(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory key-value store with TTL support.
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    /// Creates an empty store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store whose TTLs are evaluated against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !is_expired(entry, now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deadline(&self, ttl: Duration) -> KvResult<DateTime<Utc>> {
        let step = ChronoDuration::from_std(ttl)
            .map_err(|_| KvError::Malformed(format!("ttl {ttl:?} is out of range")))?;
        self.clock
            .now()
            .checked_add_signed(step)
            .ok_or_else(|| KvError::Malformed(format!("ttl {ttl:?} is out of range")))
    }
}

impl MemoryKvStore {
    /// Counts one key-creating write and sweeps expired keys periodically.
    ///
    /// Called with the keyspace lock held.
    fn note_write(&self, entries: &mut HashMap<String, Entry>, now: DateTime<Utc>) {
        let writes = self.writes.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            entries.retain(|_, entry| !is_expired(entry, now));
        }
    }
}

fn is_expired(entry: &Entry, now: DateTime<Utc>) -> bool {
    entry.expires_at.is_some_and(|deadline| deadline <= now)
}

fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str, now: DateTime<Utc>) {
    if entries.get(key).is_some_and(|entry| is_expired(entry, now)) {
        entries.remove(key);
    }
}

fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Entry> {
    purge_expired(entries, key, now);
    entries.get_mut(key)
}

fn bytes_mut<'a>(entry: &'a mut Entry, key: &str) -> KvResult<&'a mut Vec<u8>> {
    match &mut entry.value {
        Value::Bytes(bytes) => Ok(bytes),
        Value::Sorted(_) => Err(KvError::WrongType(key.to_string())),
    }
}

fn check_bit_offset(offset: u64) -> KvResult<()> {
    if offset > MAX_BIT_OFFSET {
        return Err(KvError::Malformed(format!(
            "bit offset {offset} exceeds {MAX_BIT_OFFSET}"
        )));
    }
    Ok(())
}

fn read_bit(bytes: &[u8], offset: u64) -> bool {
    let byte_index = (offset / 8) as usize;
    let shift = 7 - (offset % 8) as u32;
    bytes
        .get(byte_index)
        .is_some_and(|byte| (*byte >> shift) & 1 == 1)
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> KvResult<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let Some(entry) = live(&mut entries, key, now) else {
            return Ok(None);
        };
        let bytes = bytes_mut(entry, key)?;
        String::from_utf8(bytes.clone())
            .map(Some)
            .map_err(|_| KvError::WrongType(key.to_string()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let expires_at = ttl.map(|ttl| self.deadline(ttl)).transpose()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.as_bytes().to_vec()),
                expires_at,
            },
        );
        self.note_write(&mut entries, now);
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let expires_at = self.deadline(ttl)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.as_bytes().to_vec()),
                expires_at: Some(expires_at),
            },
        );
        self.note_write(&mut entries, now);
        Ok(true)
    }

    fn delete(&self, key: &str) -> KvResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if live(&mut entries, key, now).is_none() {
            return Ok(false);
        }
        Ok(entries.remove(key).is_some())
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> KvResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let matches = match live(&mut entries, key, now) {
            Some(Entry {
                value: Value::Bytes(bytes),
                ..
            }) => bytes.as_slice() == expected.as_bytes(),
            _ => false,
        };
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    fn incr(&self, key: &str) -> KvResult<i64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let Some(entry) = live(&mut entries, key, now) else {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Bytes(b"1".to_vec()),
                    expires_at: None,
                },
            );
            self.note_write(&mut entries, now);
            return Ok(1);
        };

        let bytes = bytes_mut(entry, key)?;
        let current = std::str::from_utf8(bytes)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
            .ok_or_else(|| KvError::WrongType(key.to_string()))?;
        let next = current
            .checked_add(1)
            .ok_or_else(|| KvError::Malformed(format!("increment of `{key}` would overflow")))?;
        *bytes = next.to_string().into_bytes();
        Ok(next)
    }

    fn set_bit(&self, key: &str, offset: u64, bit: bool) -> KvResult<bool> {
        check_bit_offset(offset)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key, now);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Bytes(Vec::new()),
            expires_at: None,
        });

        let bytes = bytes_mut(entry, key)?;
        let byte_index = (offset / 8) as usize;
        if bytes.len() <= byte_index {
            bytes.resize(byte_index + 1, 0);
        }
        let previous = read_bit(bytes, offset);
        let mask = 1u8 << (7 - (offset % 8) as u32);
        if bit {
            bytes[byte_index] |= mask;
        } else {
            bytes[byte_index] &= !mask;
        }
        self.note_write(&mut entries, now);
        Ok(previous)
    }

    fn get_bit(&self, key: &str, offset: u64) -> KvResult<bool> {
        check_bit_offset(offset)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match live(&mut entries, key, now) {
            Some(entry) => Ok(read_bit(bytes_mut(entry, key)?, offset)),
            None => Ok(false),
        }
    }

    fn get_unsigned_bits(&self, key: &str, width: u8) -> KvResult<u64> {
        check_bitfield_width(width)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let Some(entry) = live(&mut entries, key, now) else {
            return Ok(0);
        };
        let bytes = bytes_mut(entry, key)?;
        let field = (0..u64::from(width)).fold(0u64, |acc, offset| {
            (acc << 1) | u64::from(read_bit(bytes, offset))
        });
        Ok(field)
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> KvResult<()> {
        if score.is_nan() {
            return Err(KvError::Malformed("sorted-set score must not be NaN".into()));
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key, now);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Sorted(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Sorted(members) => {
                members.insert(member.to_string(), score);
            }
            Value::Bytes(_) => return Err(KvError::WrongType(key.to_string())),
        }
        self.note_write(&mut entries, now);
        Ok(())
    }

    fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let Some(entry) = live(&mut entries, key, now) else {
            return Ok(false);
        };
        let (removed, now_empty) = match &mut entry.value {
            Value::Sorted(members) => (members.remove(member).is_some(), members.is_empty()),
            Value::Bytes(_) => return Err(KvError::WrongType(key.to_string())),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }

    fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match live(&mut entries, key, now) {
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => Ok(members.get(member).copied()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    fn zrev_range_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        count: usize,
    ) -> KvResult<Vec<(String, f64)>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let members = match live(&mut entries, key, now) {
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => members,
            Some(_) => return Err(KvError::WrongType(key.to_string())),
            None => return Ok(Vec::new()),
        };

        let mut selected: Vec<(String, f64)> = members
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        // Equal scores order by member descending, matching the external store.
        selected.sort_by(|left, right| {
            right
                .1
                .partial_cmp(&left.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| right.0.cmp(&left.0))
        });
        Ok(selected.into_iter().skip(offset).take(count).collect())
    }

    fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let deadline = self.deadline(ttl)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match live(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = Some(deadline);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let remaining = live(&mut entries, key, now)
            .and_then(|entry| entry.expires_at)
            .and_then(|deadline| (deadline - now).to_std().ok());
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryKvStore, SWEEP_EVERY_WRITES};
    use crate::clock::ManualClock;
    use crate::kv::{KvError, KvStore};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    fn store_with_clock() -> (MemoryKvStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        (MemoryKvStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn expired_keys_are_swept_without_being_read_again() {
        let (store, clock) = store_with_clock();
        for id in 0..10_000 {
            store
                .set(&format!("cache:shop:{id}"), "", Some(Duration::from_secs(120)))
                .unwrap();
        }
        assert_eq!(store.entries.lock().len(), 10_000);

        clock.advance(Duration::from_secs(60 * 60));
        for day in 0..SWEEP_EVERY_WRITES {
            store.incr(&format!("seq:order:{day}")).unwrap();
        }

        let raw = store.entries.lock().len() as u64;
        assert!(raw <= SWEEP_EVERY_WRITES, "raw entries after sweep: {raw}");
        assert_eq!(store.get("seq:order:0").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn set_if_absent_only_first_writer_wins_until_expiry() {
        let (store, clock) = store_with_clock();
        assert!(store
            .set_if_absent("lock:a", "one", Duration::from_secs(10))
            .unwrap());
        assert!(!store
            .set_if_absent("lock:a", "two", Duration::from_secs(10))
            .unwrap());

        clock.advance(Duration::from_secs(10));
        assert!(store
            .set_if_absent("lock:a", "two", Duration::from_secs(10))
            .unwrap());
        assert_eq!(store.get("lock:a").unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn delete_if_equals_ignores_foreign_values() {
        let store = MemoryKvStore::new();
        store.set("k", "mine", None).unwrap();
        assert!(!store.delete_if_equals("k", "theirs").unwrap());
        assert!(store.delete_if_equals("k", "mine").unwrap());
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn incr_rejects_non_integer_values() {
        let store = MemoryKvStore::new();
        assert_eq!(store.incr("n").unwrap(), 1);
        assert_eq!(store.incr("n").unwrap(), 2);
        store.set("s", "abc", None).unwrap();
        assert!(matches!(store.incr("s"), Err(KvError::WrongType(_))));
    }

    #[test]
    fn bit_field_reads_offset_zero_as_most_significant() {
        let store = MemoryKvStore::new();
        store.set_bit("b", 0, true).unwrap();
        store.set_bit("b", 2, true).unwrap();
        // bits 0..3 = 1 0 1
        assert_eq!(store.get_unsigned_bits("b", 3).unwrap(), 0b101);
        // bits 0..4 = 1 0 1 0
        assert_eq!(store.get_unsigned_bits("b", 4).unwrap(), 0b1010);
        assert!(store.get_bit("b", 2).unwrap());
        assert!(!store.get_bit("b", 100).unwrap());
        assert!(store.set_bit("b", 2, false).unwrap());
        assert_eq!(store.get_unsigned_bits("b", 3).unwrap(), 0b100);
    }

    #[test]
    fn bit_field_width_is_bounded() {
        let store = MemoryKvStore::new();
        assert!(matches!(
            store.get_unsigned_bits("b", 0),
            Err(KvError::Malformed(_))
        ));
        assert!(matches!(
            store.get_unsigned_bits("b", 64),
            Err(KvError::Malformed(_))
        ));
        assert_eq!(store.get_unsigned_bits("missing", 31).unwrap(), 0);
    }

    #[test]
    fn sorted_set_range_is_descending_with_limit() {
        let store = MemoryKvStore::new();
        store.zadd("z", "a", 1.0).unwrap();
        store.zadd("z", "b", 3.0).unwrap();
        store.zadd("z", "c", 2.0).unwrap();
        store.zadd("z", "d", 5.0).unwrap();

        let page = store.zrev_range_by_score("z", 4.0, 0.0, 1, 2).unwrap();
        assert_eq!(
            page,
            vec![("c".to_string(), 2.0), ("a".to_string(), 1.0)]
        );
        assert!(matches!(store.get("z"), Err(KvError::WrongType(_))));
    }

    #[test]
    fn ttl_reports_remaining_time_and_expire_requires_key() {
        let (store, clock) = store_with_clock();
        store
            .set("k", "v", Some(Duration::from_secs(60)))
            .unwrap();
        clock.advance(Duration::from_secs(15));
        assert_eq!(store.ttl("k").unwrap(), Some(Duration::from_secs(45)));
        assert!(!store.expire("missing", Duration::from_secs(5)).unwrap());
        assert!(store.expire("k", Duration::from_secs(5)).unwrap());
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("k").unwrap(), None);
        assert!(store.is_empty());
    }
}
