//! Domain records shared by repositories, cache and services.
//!
//! # Invariants
//! - Relational ids are positive `i64` row ids assigned by the store.
//! - Order ids are issued by `IdWorker`, never by the relational store.

pub mod shop;
pub mod voucher;

/// Identifier of an authenticated user, supplied by the caller.
pub type UserId = i64;

pub use shop::{Shop, ShopId};
pub use voucher::{OrderId, SeckillVoucher, VoucherId, VoucherOrder};
