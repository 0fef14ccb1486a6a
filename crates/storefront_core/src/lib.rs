//! Concurrency-safe core of the storefront backend.
//!
//! Distributed mutex, distributed id generation, cache-aside entity reads,
//! flash-sale ordering and attendance bitmaps, built on a shared key-value
//! store and a SQLite relational store.

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod id_worker;
pub mod kv;
pub mod lock;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use cache::{CacheError, CacheResult, EntityCache, Lookup};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, CoreConfig};
pub use context::{LockOwner, RequestContext};
pub use id_worker::{IdError, IdWorker};
pub use kv::{KvError, KvResult, KvStore, MemoryKvStore};
pub use lock::{DistributedMutex, LockGuard};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::{
    OrderId, SeckillVoucher, Shop, ShopId, UserId, VoucherId, VoucherOrder,
};
pub use repo::shop_repo::{ShopRepository, SqliteShopRepository};
pub use repo::voucher_repo::{SqliteVoucherRepository, VoucherRepository};
pub use repo::{RepoError, RepoResult};
pub use service::attendance_service::AttendanceService;
pub use service::feed_service::{FeedPage, FeedService, PostId};
pub use service::like_service::LikeService;
pub use service::shop_service::{ShopService, SHOP_ENTITY};
pub use service::voucher_order_service::{
    SeckillError, SeckillResult, VoucherOrderService, ORDER_BIZ_TAG, VOUCHER_ENTITY,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
