//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository, cache and shared-store calls into use-case
//!   level APIs.
//! - Keep callers decoupled from storage details.

pub mod attendance_service;
pub mod feed_service;
pub mod like_service;
pub mod shop_service;
pub mod voucher_order_service;
