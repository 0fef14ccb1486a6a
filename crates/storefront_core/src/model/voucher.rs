//! Seckill voucher and order records.
//!
//! # Invariants
//! - `stock` is never negative in storage.
//! - `begin_time < end_time` for every persisted voucher.
//! - An order exists only for a successful stock decrement and is never
//!   mutated afterwards.

use super::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type VoucherId = i64;

/// Order identifier issued by `IdWorker`.
pub type OrderId = u64;

/// Limited-stock voucher sold inside a time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeckillVoucher {
    pub id: VoucherId,
    pub title: String,
    pub stock: i64,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SeckillVoucher {
    /// Creates an unsaved voucher; `id` is assigned on insert.
    pub fn new(
        title: impl Into<String>,
        stock: i64,
        begin_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            title: title.into(),
            stock,
            begin_time,
            end_time,
        }
    }

    /// Checks persisted-state invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.stock < 0 {
            return Err(format!("stock must not be negative, got {}", self.stock));
        }
        if self.begin_time >= self.end_time {
            return Err(format!(
                "begin_time {} must precede end_time {}",
                self.begin_time, self.end_time
            ));
        }
        Ok(())
    }
}

/// One successful seckill purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherOrder {
    pub id: OrderId,
    pub user_id: UserId,
    pub voucher_id: VoucherId,
    pub created_at: DateTime<Utc>,
}
