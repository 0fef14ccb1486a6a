//! Daily check-in counter on one bitmap per user and month.
//!
//! # Invariants
//! - Bit `day_of_month - 1` of `sign:{user}:{yyyyMM}` is 1 iff the user
//!   checked in that day (UTC).
//! - `current_streak` counts consecutive check-ins ending today: it reads
//!   the first `day_of_month` bits as one unsigned field (today is the least
//!   significant bit) and stops at the first 0 bit.

use crate::clock::Clock;
use crate::kv::keys::sign_key;
use crate::kv::{KvResult, KvStore};
use crate::model::UserId;
use chrono::Datelike;
use log::debug;
use std::sync::Arc;

/// Attendance service over the shared store.
pub struct AttendanceService {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl AttendanceService {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Records today's check-in. Returns `true` if the user had already
    /// checked in today.
    pub fn check_in(&self, user_id: UserId) -> KvResult<bool> {
        let now = self.clock.now();
        let key = sign_key(user_id, now);
        let offset = u64::from(now.day0());
        let already = self.store.set_bit(&key, offset, true)?;
        debug!(
            "event=check_in module=attendance status=ok user_id={} day={} repeated={}",
            user_id,
            now.day(),
            already
        );
        Ok(already)
    }

    /// Consecutive check-in days ending today; 0 if today is not checked in.
    pub fn current_streak(&self, user_id: UserId) -> KvResult<u32> {
        let mut field = self.month_to_date(user_id)?;
        let mut streak = 0;
        while field & 1 == 1 {
            streak += 1;
            field >>= 1;
        }
        Ok(streak)
    }

    /// Days checked in so far this month.
    pub fn monthly_total(&self, user_id: UserId) -> KvResult<u32> {
        Ok(self.month_to_date(user_id)?.count_ones())
    }

    fn month_to_date(&self, user_id: UserId) -> KvResult<u64> {
        let now = self.clock.now();
        let key = sign_key(user_id, now);
        // day() is 1..=31, always a valid field width.
        self.store.get_unsigned_bits(&key, now.day() as u8)
    }
}
