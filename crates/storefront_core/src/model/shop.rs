//! Shop record, the canonical cache-aside entity.

use serde::{Deserialize, Serialize};

pub type ShopId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shop {
    pub id: ShopId,
    pub name: String,
    pub area: Option<String>,
    pub address: String,
    /// Average price in cents.
    pub avg_price: i64,
    /// Rating in tenths (0..=50).
    pub score: i32,
}

impl Shop {
    /// Creates an unsaved shop; `id` is assigned on insert.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            area: None,
            address: address.into(),
            avg_price: 0,
            score: 0,
        }
    }
}
