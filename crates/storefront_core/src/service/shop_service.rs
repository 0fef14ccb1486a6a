//! Shop use-case service: cache-aside reads, invalidate-on-write updates.

use crate::cache::{CacheResult, EntityCache};
use crate::model::{Shop, ShopId};
use crate::repo::shop_repo::ShopRepository;
use crate::repo::RepoResult;

pub const SHOP_ENTITY: &str = "shop";

/// Shop service facade over repository and cache.
pub struct ShopService<R: ShopRepository> {
    repo: R,
    cache: EntityCache<Shop>,
}

impl<R: ShopRepository> ShopService<R> {
    pub fn new(repo: R, cache: EntityCache<Shop>) -> Self {
        Self { repo, cache }
    }

    /// Creates a shop. Any stale "absent" sentinel for the new id is dropped.
    pub fn create_shop(&self, shop: &Shop) -> CacheResult<ShopId> {
        let id = self.repo.create_shop(shop)?;
        self.cache.invalidate(id)?;
        Ok(id)
    }

    /// Reads one shop through the cache.
    pub fn query_by_id(&self, id: ShopId) -> CacheResult<Shop> {
        self.cache.get_or_load(id, |id| self.repo.get_shop(id))
    }

    /// Persists `shop` and then invalidates its cache entry.
    pub fn update(&self, shop: &Shop) -> CacheResult<()> {
        self.cache.update(shop.id, || self.repo.update_shop(shop))
    }

    /// Reads directly from the repository, bypassing the cache.
    pub fn load_uncached(&self, id: ShopId) -> RepoResult<Option<Shop>> {
        self.repo.get_shop(id)
    }
}
