//! Seckill (flash sale) order use-case service.
//!
//! # Responsibility
//! - Gate purchases by sale window and a cached stock hint.
//! - Turn one authoritative conditional decrement into exactly one order.
//! - Enforce one order per user and voucher.
//!
//! # Invariants
//! - The cached voucher is only a fast-path filter; `try_decrement_stock`
//!   is the single source of truth for inventory.
//! - Decrement and order insert commit together or not at all.
//! - The per-user lock is held across the duplicate check and the
//!   transaction, and released on every exit path.
//! - No step retries internally; every failure is returned to the caller.

use crate::cache::{CacheError, EntityCache};
use crate::clock::Clock;
use crate::config::DEFAULT_ORDER_LOCK_TTL_SECS;
use crate::context::RequestContext;
use crate::id_worker::{IdError, IdWorker};
use crate::kv::KvError;
use crate::lock::DistributedMutex;
use crate::model::{OrderId, SeckillVoucher, UserId, VoucherId, VoucherOrder};
use crate::repo::voucher_repo::VoucherRepository;
use crate::repo::RepoError;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const VOUCHER_ENTITY: &str = "voucher";
/// Id counter namespace for order ids.
pub const ORDER_BIZ_TAG: &str = "order";

pub type SeckillResult<T> = Result<T, SeckillError>;

/// Outcome of a failed seckill call.
///
/// Business outcomes and infrastructure failures are distinct variants so
/// callers never report an outage as "sold out".
#[derive(Debug)]
pub enum SeckillError {
    VoucherNotFound(VoucherId),
    NotStarted {
        voucher_id: VoucherId,
        begin_time: DateTime<Utc>,
    },
    Ended {
        voucher_id: VoucherId,
        end_time: DateTime<Utc>,
    },
    SoldOut(VoucherId),
    AlreadyPurchased {
        voucher_id: VoucherId,
        user_id: UserId,
    },
    /// Another request of the same user holds the order lock.
    LockUnavailable(String),
    Malformed(String),
    Kv(KvError),
    Repo(RepoError),
    Codec(serde_json::Error),
    Id(IdError),
}

impl SeckillError {
    /// Stable machine-readable code for this outcome.
    pub fn code(&self) -> &'static str {
        match self {
            Self::VoucherNotFound(_) => "voucher_not_found",
            Self::NotStarted { .. } => "seckill_not_started",
            Self::Ended { .. } => "seckill_ended",
            Self::SoldOut(_) => "seckill_sold_out",
            Self::AlreadyPurchased { .. } => "seckill_already_purchased",
            Self::LockUnavailable(_) => "lock_unavailable",
            Self::Malformed(_) => "malformed_input",
            Self::Kv(_) | Self::Repo(_) | Self::Codec(_) | Self::Id(_) => "infrastructure_failure",
        }
    }

    /// Whether this is an expected business rejection rather than a fault.
    pub fn is_business_outcome(&self) -> bool {
        self.code() != "infrastructure_failure"
    }
}

impl Display for SeckillError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VoucherNotFound(id) => write!(f, "voucher not found: {id}"),
            Self::NotStarted {
                voucher_id,
                begin_time,
            } => write!(f, "seckill for voucher {voucher_id} starts at {begin_time}"),
            Self::Ended {
                voucher_id,
                end_time,
            } => write!(f, "seckill for voucher {voucher_id} ended at {end_time}"),
            Self::SoldOut(id) => write!(f, "voucher {id} is sold out"),
            Self::AlreadyPurchased {
                voucher_id,
                user_id,
            } => write!(f, "user {user_id} already ordered voucher {voucher_id}"),
            Self::LockUnavailable(resource) => write!(f, "lock `{resource}` is held"),
            Self::Malformed(message) => write!(f, "malformed input: {message}"),
            Self::Kv(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
            Self::Codec(err) => write!(f, "{err}"),
            Self::Id(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SeckillError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Kv(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::Codec(err) => Some(err),
            Self::Id(err) => Some(err),
            _ => None,
        }
    }
}

impl From<KvError> for SeckillError {
    fn from(value: KvError) -> Self {
        match value {
            KvError::Malformed(message) => Self::Malformed(message),
            other => Self::Kv(other),
        }
    }
}

impl From<RepoError> for SeckillError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound { id, .. } => Self::VoucherNotFound(id),
            RepoError::Validation(message) => Self::Malformed(message),
            other => Self::Repo(other),
        }
    }
}

impl From<IdError> for SeckillError {
    fn from(value: IdError) -> Self {
        match value {
            IdError::Kv(err) => err.into(),
            other => Self::Id(other),
        }
    }
}

impl From<CacheError> for SeckillError {
    fn from(value: CacheError) -> Self {
        match value {
            CacheError::NotFound { id, .. } => Self::VoucherNotFound(id),
            CacheError::Kv(err) => err.into(),
            CacheError::Codec(err) => Self::Codec(err),
            CacheError::Repo(err) => err.into(),
        }
    }
}

/// Seckill service facade.
pub struct VoucherOrderService<R: VoucherRepository> {
    repo: R,
    cache: EntityCache<SeckillVoucher>,
    mutex: DistributedMutex,
    ids: IdWorker,
    clock: Arc<dyn Clock>,
    lock_ttl: Duration,
}

impl<R: VoucherRepository> VoucherOrderService<R> {
    pub fn new(
        repo: R,
        cache: EntityCache<SeckillVoucher>,
        mutex: DistributedMutex,
        ids: IdWorker,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            cache,
            mutex,
            ids,
            clock,
            lock_ttl: Duration::from_secs(DEFAULT_ORDER_LOCK_TTL_SECS),
        }
    }

    /// Overrides the per-user order lock lease.
    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn create_voucher(&self, voucher: &SeckillVoucher) -> SeckillResult<VoucherId> {
        let id = self.repo.create_voucher(voucher)?;
        self.cache.invalidate(id)?;
        Ok(id)
    }

    /// Persists `voucher` and invalidates its cached copy.
    pub fn update_voucher(&self, voucher: &SeckillVoucher) -> SeckillResult<()> {
        self.cache
            .update(voucher.id, || self.repo.update_voucher(voucher))?;
        Ok(())
    }

    /// Reads one voucher through the cache.
    pub fn get_voucher(&self, voucher_id: VoucherId) -> SeckillResult<SeckillVoucher> {
        let voucher = self
            .cache
            .get_or_load(voucher_id, |id| self.repo.get_voucher(id))?;
        Ok(voucher)
    }

    /// Number of orders created for `voucher_id`.
    pub fn sold_count(&self, voucher_id: VoucherId) -> SeckillResult<u64> {
        Ok(self.repo.count_orders(voucher_id)?)
    }

    /// Places one seckill order for `ctx.user_id`.
    ///
    /// The order lock `order-{user_id}` is scoped to the user, not the
    /// voucher: while one order of a user is in flight, a concurrent order
    /// by the same user for any voucher is turned away with
    /// `LockUnavailable`. Sequential orders for different vouchers succeed.
    ///
    /// # Errors
    /// - `NotStarted`/`Ended` outside the sale window.
    /// - `SoldOut` when the cached hint or the authoritative decrement says so.
    /// - `LockUnavailable` when the same user has a request in flight.
    /// - `AlreadyPurchased` when the user already holds an order.
    pub fn place_order(
        &self,
        ctx: &RequestContext,
        voucher_id: VoucherId,
    ) -> SeckillResult<OrderId> {
        let started_at = Instant::now();
        let result = self.place_order_inner(ctx, voucher_id);
        match &result {
            Ok(order_id) => info!(
                "event=seckill_order module=seckill status=ok voucher_id={} user_id={} order_id={} duration_ms={}",
                voucher_id,
                ctx.user_id,
                order_id,
                started_at.elapsed().as_millis()
            ),
            Err(err) if err.is_business_outcome() => info!(
                "event=seckill_order module=seckill status=rejected voucher_id={} user_id={} code={}",
                voucher_id,
                ctx.user_id,
                err.code()
            ),
            Err(err) => error!(
                "event=seckill_order module=seckill status=error voucher_id={} user_id={} error_code={} error={}",
                voucher_id,
                ctx.user_id,
                err.code(),
                err
            ),
        }
        result
    }

    fn place_order_inner(
        &self,
        ctx: &RequestContext,
        voucher_id: VoucherId,
    ) -> SeckillResult<OrderId> {
        let voucher = self.get_voucher(voucher_id)?;
        let now = self.clock.now();
        if now < voucher.begin_time {
            return Err(SeckillError::NotStarted {
                voucher_id,
                begin_time: voucher.begin_time,
            });
        }
        if now > voucher.end_time {
            return Err(SeckillError::Ended {
                voucher_id,
                end_time: voucher.end_time,
            });
        }
        if voucher.stock < 1 {
            return Err(SeckillError::SoldOut(voucher_id));
        }

        let resource = format!("order-{}", ctx.user_id);
        let Some(guard) = self.mutex.try_lock(&resource, self.lock_ttl, &ctx.owner)? else {
            return Err(SeckillError::LockUnavailable(resource));
        };
        let outcome = self.create_order(ctx.user_id, voucher_id);
        if let Err(err) = guard.unlock() {
            warn!(
                "event=lock_release module=seckill status=error resource={} error={}",
                resource, err
            );
        }
        outcome
    }

    fn create_order(&self, user_id: UserId, voucher_id: VoucherId) -> SeckillResult<OrderId> {
        if self.repo.find_order(voucher_id, user_id)?.is_some() {
            return Err(SeckillError::AlreadyPurchased {
                voucher_id,
                user_id,
            });
        }

        let outcome = self.repo.in_transaction(|repo| {
            if !repo.try_decrement_stock(voucher_id)? {
                return Err(SeckillError::SoldOut(voucher_id));
            }

            let order = VoucherOrder {
                id: self.ids.next_id(ORDER_BIZ_TAG)?,
                user_id,
                voucher_id,
                created_at: self.clock.now(),
            };
            // Only the (voucher, user) constraint blames the buyer; an id
            // collision stays an infrastructure failure.
            repo.insert_order(&order).map_err(|err| match err {
                RepoError::Conflict(_) => SeckillError::AlreadyPurchased {
                    voucher_id,
                    user_id,
                },
                other => other.into(),
            })?;
            Ok(order.id)
        });

        if matches!(outcome, Err(SeckillError::SoldOut(_))) {
            // Let the next reader observe the exhausted stock from the cache.
            if let Err(err) = self.cache.invalidate(voucher_id) {
                warn!(
                    "event=cache_invalidate module=seckill status=error voucher_id={} error={}",
                    voucher_id, err
                );
            }
        }
        outcome
    }
}
