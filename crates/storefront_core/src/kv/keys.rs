//! Key layout for every record the core keeps in the shared store.
//!
//! # Invariants
//! - Every caller-supplied segment matches `SEGMENT_RE` before it is
//!   embedded in a key, so segments can never inject `:` separators.
//! - Prefixes are stable; changing one orphans live data.

use super::{KvError, KvResult};
use chrono::{DateTime, Datelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

pub const LOCK_PREFIX: &str = "lock:";
pub const SEQ_PREFIX: &str = "seq:";
pub const CACHE_PREFIX: &str = "cache:";
pub const SIGN_PREFIX: &str = "sign:";
pub const FEED_PREFIX: &str = "feed:";
pub const LIKED_PREFIX: &str = "liked:";

static SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,64}$").expect("valid key segment regex"));

/// Validates one caller-supplied key segment.
pub fn validate_segment(kind: &str, value: &str) -> KvResult<()> {
    if SEGMENT_RE.is_match(value) {
        return Ok(());
    }
    Err(KvError::Malformed(format!(
        "{kind} `{value}` must be 1-64 chars of [A-Za-z0-9_.-]"
    )))
}

/// `lock:{resource}`
pub fn lock_key(resource: &str) -> KvResult<String> {
    validate_segment("lock resource", resource)?;
    Ok(format!("{LOCK_PREFIX}{resource}"))
}

/// `seq:{biz_tag}:{yyyy:MM:dd}` using the UTC calendar date of `at`.
pub fn seq_key(biz_tag: &str, at: DateTime<Utc>) -> KvResult<String> {
    validate_segment("biz tag", biz_tag)?;
    Ok(format!("{SEQ_PREFIX}{biz_tag}:{}", at.format("%Y:%m:%d")))
}

/// `cache:{entity}:{id}`
pub fn cache_key(entity: &str, id: i64) -> KvResult<String> {
    validate_segment("entity type", entity)?;
    Ok(format!("{CACHE_PREFIX}{entity}:{id}"))
}

/// `sign:{user_id}:{yyyyMM}`
pub fn sign_key(user_id: i64, at: DateTime<Utc>) -> String {
    format!("{SIGN_PREFIX}{user_id}:{:04}{:02}", at.year(), at.month())
}

/// `feed:{user_id}`
pub fn feed_key(user_id: i64) -> String {
    format!("{FEED_PREFIX}{user_id}")
}

/// `liked:{post_id}`
pub fn liked_key(post_id: i64) -> String {
    format!("{LIKED_PREFIX}{post_id}")
}
