//! Shop repository contract and SQLite implementation.
//!
//! # Invariants
//! - `update_shop` reports `NotFound` when no row matched; it never upserts.

use super::{ensure_connection_ready, RepoError, RepoResult};
use crate::model::{Shop, ShopId};
use rusqlite::{params, Connection, OptionalExtension, Row};

const SHOP_SELECT_SQL: &str = "SELECT
    id,
    name,
    area,
    address,
    avg_price,
    score
FROM shops";

/// Repository interface for shop records.
pub trait ShopRepository {
    fn create_shop(&self, shop: &Shop) -> RepoResult<ShopId>;
    fn update_shop(&self, shop: &Shop) -> RepoResult<()>;
    fn get_shop(&self, id: ShopId) -> RepoResult<Option<Shop>>;
}

/// SQLite-backed shop repository.
pub struct SqliteShopRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteShopRepository<'conn> {
    /// Constructs a repository from a migrated/ready connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn, &["shops"])?;
        Ok(Self { conn })
    }
}

impl ShopRepository for SqliteShopRepository<'_> {
    fn create_shop(&self, shop: &Shop) -> RepoResult<ShopId> {
        validate_shop(shop)?;
        self.conn.execute(
            "INSERT INTO shops (name, area, address, avg_price, score)
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                shop.name.as_str(),
                shop.area.as_deref(),
                shop.address.as_str(),
                shop.avg_price,
                shop.score,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_shop(&self, shop: &Shop) -> RepoResult<()> {
        validate_shop(shop)?;
        let changed = self.conn.execute(
            "UPDATE shops
             SET
                name = ?1,
                area = ?2,
                address = ?3,
                avg_price = ?4,
                score = ?5,
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?6;",
            params![
                shop.name.as_str(),
                shop.area.as_deref(),
                shop.address.as_str(),
                shop.avg_price,
                shop.score,
                shop.id,
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound {
                entity: "shop",
                id: shop.id,
            });
        }
        Ok(())
    }

    fn get_shop(&self, id: ShopId) -> RepoResult<Option<Shop>> {
        let shop = self
            .conn
            .query_row(
                &format!("{SHOP_SELECT_SQL} WHERE id = ?1;"),
                [id],
                parse_shop_row,
            )
            .optional()?;
        Ok(shop)
    }
}

fn parse_shop_row(row: &Row<'_>) -> rusqlite::Result<Shop> {
    Ok(Shop {
        id: row.get("id")?,
        name: row.get("name")?,
        area: row.get("area")?,
        address: row.get("address")?,
        avg_price: row.get("avg_price")?,
        score: row.get("score")?,
    })
}

fn validate_shop(shop: &Shop) -> RepoResult<()> {
    if shop.name.trim().is_empty() {
        return Err(RepoError::Validation("shop name must not be blank".into()));
    }
    if shop.avg_price < 0 {
        return Err(RepoError::Validation(format!(
            "avg_price must not be negative, got {}",
            shop.avg_price
        )));
    }
    if !(0..=50).contains(&shop.score) {
        return Err(RepoError::Validation(format!(
            "score must be within 0..=50, got {}",
            shop.score
        )));
    }
    Ok(())
}
