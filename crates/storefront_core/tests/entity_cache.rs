use chrono::{TimeZone, Utc};
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::Duration;
use storefront_core::cache::NULL_SENTINEL;
use storefront_core::db::open_db_in_memory;
use storefront_core::{
    CacheError, EntityCache, KvStore, Lookup, ManualClock, MemoryKvStore, RepoError, Shop,
    ShopService, SqliteShopRepository, SHOP_ENTITY,
};

fn setup() -> (EntityCache<Shop>, Arc<MemoryKvStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryKvStore::with_clock(clock.clone()));
    (EntityCache::new(store.clone(), SHOP_ENTITY), store, clock)
}

fn sample_shop(id: i64, name: &str) -> Shop {
    Shop {
        id,
        ..Shop::new(name, "Harbor Road 8")
    }
}

#[test]
fn absent_id_is_loaded_once_until_null_ttl_expires() {
    let (cache, store, clock) = setup();
    let loads = Cell::new(0);
    let load = |_id: i64| -> Result<Option<Shop>, RepoError> {
        loads.set(loads.get() + 1);
        Ok(None)
    };

    assert!(matches!(
        cache.get_or_load(404, load),
        Err(CacheError::NotFound { id: 404, .. })
    ));
    assert_eq!(
        store.get("cache:shop:404").unwrap().as_deref(),
        Some(NULL_SENTINEL)
    );
    assert!(matches!(
        cache.get_or_load(404, load),
        Err(CacheError::NotFound { .. })
    ));
    assert_eq!(loads.get(), 1);

    clock.advance(Duration::from_secs(121));
    assert!(cache.get_or_load(404, load).is_err());
    assert_eq!(loads.get(), 2);
}

#[test]
fn hit_skips_loader_and_update_forces_reload() {
    let (cache, _, _) = setup();
    let loads = Cell::new(0);
    let current = RefCell::new(sample_shop(1, "Tea House"));
    let load = |_id: i64| -> Result<Option<Shop>, RepoError> {
        loads.set(loads.get() + 1);
        Ok(Some(current.borrow().clone()))
    };

    assert_eq!(cache.get_or_load(1, load).unwrap().name, "Tea House");
    assert_eq!(cache.get_or_load(1, load).unwrap().name, "Tea House");
    assert_eq!(loads.get(), 1);

    cache
        .update(1, || {
            current.borrow_mut().name = "Tea House Deluxe".to_string();
            Ok(())
        })
        .unwrap();
    assert_eq!(cache.lookup(1).unwrap(), Lookup::Miss);
    assert_eq!(cache.get_or_load(1, load).unwrap().name, "Tea House Deluxe");
    assert_eq!(loads.get(), 2);
}

#[test]
fn failed_write_keeps_cached_copy() {
    let (cache, _, _) = setup();
    cache
        .get_or_load(3, |_| Ok(Some(sample_shop(3, "Bakery"))))
        .unwrap();

    let result = cache.update(3, || {
        Err::<(), _>(RepoError::Validation("rejected".into()))
    });
    assert!(matches!(result, Err(CacheError::Repo(_))));
    assert!(matches!(cache.lookup(3).unwrap(), Lookup::Hit(_)));
}

#[test]
fn positive_entries_expire_after_cache_ttl() {
    let (cache, _, clock) = setup();
    cache
        .get_or_load(5, |_| Ok(Some(sample_shop(5, "Ramen"))))
        .unwrap();
    clock.advance(Duration::from_secs(29 * 60));
    assert!(matches!(cache.lookup(5).unwrap(), Lookup::Hit(_)));
    clock.advance(Duration::from_secs(2 * 60));
    assert_eq!(cache.lookup(5).unwrap(), Lookup::Miss);
}

#[test]
fn corrupt_payload_is_dropped() {
    let (cache, store, _) = setup();
    store.set("cache:shop:7", "{not json", None).unwrap();

    assert!(matches!(cache.lookup(7), Err(CacheError::Codec(_))));
    assert_eq!(store.get("cache:shop:7").unwrap(), None);
}

#[test]
fn shop_service_clears_absent_marker_on_create() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteShopRepository::try_new(&conn).unwrap();
    let (cache, store, _) = setup();
    let service = ShopService::new(repo, cache);

    assert!(matches!(
        service.query_by_id(1),
        Err(CacheError::NotFound { id: 1, .. })
    ));
    assert!(store.get("cache:shop:1").unwrap().is_some());

    let id = service.create_shop(&Shop::new("Dumpling Place", "Canal St 3")).unwrap();
    assert_eq!(id, 1);
    assert_eq!(store.get("cache:shop:1").unwrap(), None);
    assert_eq!(service.query_by_id(id).unwrap().name, "Dumpling Place");
}

#[test]
fn shop_service_update_is_visible_on_next_read() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteShopRepository::try_new(&conn).unwrap();
    let (cache, _, _) = setup();
    let service = ShopService::new(repo, cache);

    let id = service.create_shop(&Shop::new("Cafe", "Elm St 2")).unwrap();
    let mut shop = service.query_by_id(id).unwrap();
    shop.avg_price = 2500;
    shop.score = 45;
    service.update(&shop).unwrap();

    let reread = service.query_by_id(id).unwrap();
    assert_eq!(reread, shop);
    assert_eq!(service.load_uncached(id).unwrap(), Some(shop));
}

#[test]
fn shop_service_update_of_missing_row_fails() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteShopRepository::try_new(&conn).unwrap();
    let (cache, _, _) = setup();
    let service = ShopService::new(repo, cache);

    let err = service.update(&sample_shop(77, "Ghost")).unwrap_err();
    assert!(matches!(
        err,
        CacheError::Repo(RepoError::NotFound { id: 77, .. })
    ));
}
