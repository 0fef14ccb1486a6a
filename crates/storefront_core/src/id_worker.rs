//! Collision-free 64-bit id generation backed by a per-day store counter.
//!
//! # Layout
//! `(seconds_since_epoch << 32) | daily_sequence`
//!
//! # Invariants
//! - Ids from one `biz_tag` increase with wall-clock seconds and, inside a
//!   second, with the order of the store increments.
//! - The sequence counter key rolls over with the UTC date, so counters stay
//!   bounded and ids from different days differ in their time field.
//! - Clock regressions are not detected; duplicates are possible if the
//!   system clock moves backwards.

use crate::clock::Clock;
use crate::config::DEFAULT_ID_EPOCH_SECS;
use crate::kv::keys::seq_key;
use crate::kv::{KvError, KvStore};
use log::error;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

const SEQUENCE_BITS: u32 = 32;
const SEQUENCE_MASK: u64 = 0xFFFF_FFFF;

pub type IdResult<T> = Result<T, IdError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    Kv(KvError),
    /// The daily counter passed 32 bits; further ids would collide.
    SequenceExhausted { biz_tag: String, value: i64 },
    /// The clock reads earlier than the configured epoch.
    ClockBeforeEpoch { now_secs: i64, epoch_secs: i64 },
}

impl Display for IdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kv(err) => write!(f, "{err}"),
            Self::SequenceExhausted { biz_tag, value } => write!(
                f,
                "daily id sequence for `{biz_tag}` exhausted at {value}"
            ),
            Self::ClockBeforeEpoch {
                now_secs,
                epoch_secs,
            } => write!(f, "clock {now_secs}s is before id epoch {epoch_secs}s"),
        }
    }
}

impl Error for IdError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Kv(err) => Some(err),
            _ => None,
        }
    }
}

impl From<KvError> for IdError {
    fn from(value: KvError) -> Self {
        Self::Kv(value)
    }
}

/// Distributed id generator.
#[derive(Clone)]
pub struct IdWorker {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    epoch_secs: i64,
}

impl IdWorker {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_epoch(store, clock, DEFAULT_ID_EPOCH_SECS)
    }

    pub fn with_epoch(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, epoch_secs: i64) -> Self {
        Self {
            store,
            clock,
            epoch_secs,
        }
    }

    /// Issues the next id for `biz_tag`.
    ///
    /// One store round trip; no local state, so any number of workers and
    /// processes can share one counter.
    pub fn next_id(&self, biz_tag: &str) -> IdResult<u64> {
        let now = self.clock.now();
        let now_secs = now.timestamp();
        let offset = now_secs - self.epoch_secs;
        if offset < 0 {
            return Err(IdError::ClockBeforeEpoch {
                now_secs,
                epoch_secs: self.epoch_secs,
            });
        }

        let key = seq_key(biz_tag, now)?;
        let sequence = self.store.incr(&key)?;
        if sequence <= 0 || sequence as u64 > SEQUENCE_MASK {
            error!(
                "event=id_next module=id_worker status=error error_code=sequence_exhausted biz_tag={} value={}",
                biz_tag, sequence
            );
            return Err(IdError::SequenceExhausted {
                biz_tag: biz_tag.to_string(),
                value: sequence,
            });
        }

        Ok(((offset as u64) << SEQUENCE_BITS) | (sequence as u64 & SEQUENCE_MASK))
    }

    /// Seconds since the epoch encoded in `id`.
    pub fn timestamp_of(id: u64) -> u64 {
        id >> SEQUENCE_BITS
    }

    /// Daily sequence number encoded in `id`.
    pub fn sequence_of(id: u64) -> u64 {
        id & SEQUENCE_MASK
    }
}
