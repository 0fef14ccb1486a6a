//! Shared key-value store client contracts.
//!
//! # Responsibility
//! - Expose the store primitives the core relies on (conditional set,
//!   atomic increment, bit fields, sorted sets, TTL) behind one trait.
//! - Keep key layout in one place (`keys`).
//!
//! # Invariants
//! - Every method is a single round trip and is atomic at the store.
//! - Expired keys are indistinguishable from absent keys.
//! - Bit offsets are big-endian within each byte: offset 0 is the most
//!   significant bit of byte 0.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub mod keys;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryKvStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisKvStore;

/// Widest unsigned bit field readable in one call.
pub const MAX_BITFIELD_WIDTH: u8 = 63;

pub type KvResult<T> = Result<T, KvError>;

/// Errors raised by key-value store clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// Key segment or argument failed format validation.
    Malformed(String),
    /// Operation does not apply to the value stored at the key.
    WrongType(String),
    /// Transport or server failure.
    Backend(String),
}

impl Display for KvError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(message) => write!(f, "malformed kv input: {message}"),
            Self::WrongType(key) => write!(f, "wrong value type at key `{key}`"),
            Self::Backend(message) => write!(f, "kv backend failure: {message}"),
        }
    }
}

impl Error for KvError {}

/// Primitive operations of the shared key-value store.
pub trait KvStore: Send + Sync {
    /// Reads a string value. `None` means absent or expired.
    fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Writes a string value, replacing any previous value and TTL.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    /// Writes only when the key is absent. Returns `true` if written.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;

    /// Removes the key. Returns `true` if something was removed.
    fn delete(&self, key: &str) -> KvResult<bool>;

    /// Removes the key only when its current value equals `expected`.
    fn delete_if_equals(&self, key: &str, expected: &str) -> KvResult<bool>;

    /// Increments the integer at `key` by one, starting from zero.
    fn incr(&self, key: &str) -> KvResult<i64>;

    /// Sets one bit and returns its previous value.
    fn set_bit(&self, key: &str, offset: u64, bit: bool) -> KvResult<bool>;

    fn get_bit(&self, key: &str, offset: u64) -> KvResult<bool>;

    /// Reads an unsigned field of `width` bits starting at offset 0.
    ///
    /// Bit 0 is the field's most significant bit. Missing bytes read as 0.
    fn get_unsigned_bits(&self, key: &str, width: u8) -> KvResult<u64>;

    /// Adds or rescores one sorted-set member.
    fn zadd(&self, key: &str, member: &str, score: f64) -> KvResult<()>;

    fn zrem(&self, key: &str, member: &str) -> KvResult<bool>;

    fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>>;

    /// Members with `min <= score <= max`, highest score first, then
    /// `offset`/`count` applied.
    fn zrev_range_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        count: usize,
    ) -> KvResult<Vec<(String, f64)>>;

    /// Replaces the TTL of an existing key. Returns `false` if absent.
    fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    /// Remaining TTL. `None` when the key is absent or has no TTL.
    fn ttl(&self, key: &str) -> KvResult<Option<Duration>>;
}

pub(crate) fn check_bitfield_width(width: u8) -> KvResult<()> {
    if width == 0 || width > MAX_BITFIELD_WIDTH {
        return Err(KvError::Malformed(format!(
            "bit field width must be within 1..={MAX_BITFIELD_WIDTH}, got {width}"
        )));
    }
    Ok(())
}
