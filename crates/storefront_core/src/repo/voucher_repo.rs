//! Seckill voucher/order repository contract and SQLite implementation.
//!
//! # Responsibility
//! - Persist vouchers and their orders.
//! - Provide the authoritative conditional stock decrement.
//!
//! # Invariants
//! - `try_decrement_stock` is a single `UPDATE ... WHERE stock > 0`; stock
//!   can never go negative regardless of caller interleaving.
//! - `(voucher_id, user_id)` is unique in `voucher_orders`; violations
//!   surface as `RepoError::Conflict`.
//! - An order id that already exists surfaces as `RepoError::DuplicateKey`,
//!   never as `Conflict`: it points at the id generator, not the buyer.
//! - `in_transaction` runs under `BEGIN IMMEDIATE` and rolls back on any
//!   error returned by the closure.

use super::{
    ensure_connection_ready, is_primary_key_violation, is_unique_violation, RepoError, RepoResult,
};
use crate::model::{OrderId, SeckillVoucher, UserId, VoucherId, VoucherOrder};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

const VOUCHER_SELECT_SQL: &str = "SELECT
    id,
    title,
    stock,
    begin_time,
    end_time
FROM seckill_vouchers";

/// Repository interface for seckill vouchers and orders.
pub trait VoucherRepository {
    fn create_voucher(&self, voucher: &SeckillVoucher) -> RepoResult<VoucherId>;
    /// Replaces title, stock and window of an existing voucher.
    fn update_voucher(&self, voucher: &SeckillVoucher) -> RepoResult<()>;
    fn get_voucher(&self, id: VoucherId) -> RepoResult<Option<SeckillVoucher>>;
    /// Decrements stock by one if positive. Returns whether a row changed.
    fn try_decrement_stock(&self, id: VoucherId) -> RepoResult<bool>;
    fn insert_order(&self, order: &VoucherOrder) -> RepoResult<()>;
    fn find_order(&self, voucher_id: VoucherId, user_id: UserId)
        -> RepoResult<Option<VoucherOrder>>;
    fn count_orders(&self, voucher_id: VoucherId) -> RepoResult<u64>;
    /// Runs `work` atomically; any `Err` rolls back every write inside it.
    fn in_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<RepoError>;
}

/// SQLite-backed voucher repository.
pub struct SqliteVoucherRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteVoucherRepository<'conn> {
    /// Constructs a repository from a migrated/ready connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn, &["seckill_vouchers", "voucher_orders"])?;
        Ok(Self { conn })
    }
}

impl VoucherRepository for SqliteVoucherRepository<'_> {
    fn create_voucher(&self, voucher: &SeckillVoucher) -> RepoResult<VoucherId> {
        voucher.validate().map_err(RepoError::Validation)?;
        self.conn.execute(
            "INSERT INTO seckill_vouchers (title, stock, begin_time, end_time)
             VALUES (?1, ?2, ?3, ?4);",
            params![
                voucher.title.as_str(),
                voucher.stock,
                voucher.begin_time.timestamp_millis(),
                voucher.end_time.timestamp_millis(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_voucher(&self, voucher: &SeckillVoucher) -> RepoResult<()> {
        voucher.validate().map_err(RepoError::Validation)?;
        let changed = self.conn.execute(
            "UPDATE seckill_vouchers
             SET
                title = ?1,
                stock = ?2,
                begin_time = ?3,
                end_time = ?4,
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?5;",
            params![
                voucher.title.as_str(),
                voucher.stock,
                voucher.begin_time.timestamp_millis(),
                voucher.end_time.timestamp_millis(),
                voucher.id,
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound {
                entity: "voucher",
                id: voucher.id,
            });
        }
        Ok(())
    }

    fn get_voucher(&self, id: VoucherId) -> RepoResult<Option<SeckillVoucher>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{VOUCHER_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_voucher_row(row)?));
        }
        Ok(None)
    }

    fn try_decrement_stock(&self, id: VoucherId) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE seckill_vouchers
             SET
                stock = stock - 1,
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1
               AND stock > 0;",
            [id],
        )?;
        Ok(changed == 1)
    }

    fn insert_order(&self, order: &VoucherOrder) -> RepoResult<()> {
        let order_id = i64::try_from(order.id).map_err(|_| {
            RepoError::InvalidData(format!("order id {} does not fit a row id", order.id))
        })?;
        let inserted = self.conn.execute(
            "INSERT INTO voucher_orders (id, user_id, voucher_id, created_at)
             VALUES (?1, ?2, ?3, ?4);",
            params![
                order_id,
                order.user_id,
                order.voucher_id,
                order.created_at.timestamp_millis(),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(RepoError::Conflict(format!(
                "order {} for voucher {} and user {}: {err}",
                order.id, order.voucher_id, order.user_id
            ))),
            Err(err) if is_primary_key_violation(&err) => Err(RepoError::DuplicateKey(format!(
                "order id {} already issued: {err}",
                order.id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    fn find_order(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> RepoResult<Option<VoucherOrder>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, user_id, voucher_id, created_at
                 FROM voucher_orders
                 WHERE voucher_id = ?1
                   AND user_id = ?2;",
                params![voucher_id, user_id],
                |row| {
                    Ok((
                        row.get::<_, i64>("id")?,
                        row.get::<_, i64>("user_id")?,
                        row.get::<_, i64>("voucher_id")?,
                        row.get::<_, i64>("created_at")?,
                    ))
                },
            )
            .optional()?;

        raw.map(|(id, user_id, voucher_id, created_at)| {
            Ok(VoucherOrder {
                id: parse_order_id(id)?,
                user_id,
                voucher_id,
                created_at: parse_millis("voucher_orders.created_at", created_at)?,
            })
        })
        .transpose()
    }

    fn count_orders(&self, voucher_id: VoucherId) -> RepoResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM voucher_orders WHERE voucher_id = ?1;",
            [voucher_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn in_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<RepoError>,
    {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)
            .map_err(RepoError::from)?;
        // Dropping `tx` without commit rolls back.
        let output = work(self)?;
        tx.commit().map_err(RepoError::from)?;
        Ok(output)
    }
}

fn parse_voucher_row(row: &Row<'_>) -> RepoResult<SeckillVoucher> {
    let voucher = SeckillVoucher {
        id: row.get("id")?,
        title: row.get("title")?,
        stock: row.get("stock")?,
        begin_time: parse_millis("seckill_vouchers.begin_time", row.get("begin_time")?)?,
        end_time: parse_millis("seckill_vouchers.end_time", row.get("end_time")?)?,
    };
    voucher.validate().map_err(RepoError::InvalidData)?;
    Ok(voucher)
}

fn parse_millis(column: &str, value: i64) -> RepoResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| RepoError::InvalidData(format!("invalid timestamp `{value}` in {column}")))
}

fn parse_order_id(value: i64) -> RepoResult<OrderId> {
    OrderId::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid order id `{value}` in voucher_orders.id")))
}
