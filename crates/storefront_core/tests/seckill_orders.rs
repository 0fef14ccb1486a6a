use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use storefront_core::db::{open_db, open_db_in_memory};
use storefront_core::{
    DistributedMutex, EntityCache, IdWorker, KvStore, LockOwner, ManualClock, MemoryKvStore,
    RequestContext, SeckillError, SeckillVoucher, SqliteVoucherRepository, VoucherOrderService,
    VoucherRepository, VOUCHER_ENTITY,
};

type Service<'conn> = VoucherOrderService<SqliteVoucherRepository<'conn>>;

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
}

fn shared_store(clock: &Arc<ManualClock>) -> Arc<MemoryKvStore> {
    Arc::new(MemoryKvStore::with_clock(clock.clone()))
}

fn build_service<'conn>(
    conn: &'conn Connection,
    store: &Arc<MemoryKvStore>,
    clock: &Arc<ManualClock>,
) -> Service<'conn> {
    let kv: Arc<dyn KvStore> = store.clone();
    VoucherOrderService::new(
        SqliteVoucherRepository::try_new(conn).unwrap(),
        EntityCache::new(kv.clone(), VOUCHER_ENTITY),
        DistributedMutex::new(kv.clone()),
        IdWorker::new(kv, clock.clone()),
        clock.clone(),
    )
}

fn day_voucher(stock: i64) -> SeckillVoucher {
    SeckillVoucher::new("Lunch set 50% off", stock, at(1, 0, 0), at(2, 0, 0))
}

#[test]
fn sale_window_and_last_unit() {
    let clock = Arc::new(ManualClock::new(at(1, 0, 0) - chrono::Duration::minutes(1)));
    let store = shared_store(&clock);
    let conn = open_db_in_memory().unwrap();
    let service = build_service(&conn, &store, &clock);
    let voucher_id = service.create_voucher(&day_voucher(1)).unwrap();

    let early = service
        .place_order(&RequestContext::for_user(1), voucher_id)
        .unwrap_err();
    assert!(matches!(early, SeckillError::NotStarted { .. }));

    clock.set(at(1, 12, 0));
    let order_id = service
        .place_order(&RequestContext::for_user(1), voucher_id)
        .unwrap();
    let late_comer = service
        .place_order(&RequestContext::for_user(2), voucher_id)
        .unwrap_err();
    assert!(matches!(late_comer, SeckillError::SoldOut(id) if id == voucher_id));

    let repo = SqliteVoucherRepository::try_new(&conn).unwrap();
    let order = repo.find_order(voucher_id, 1).unwrap().unwrap();
    assert_eq!(order.id, order_id);
    assert_eq!(order.created_at, at(1, 12, 0));
    assert_eq!(repo.get_voucher(voucher_id).unwrap().unwrap().stock, 0);
}

#[test]
fn orders_after_end_are_rejected() {
    let clock = Arc::new(ManualClock::new(at(2, 0, 1)));
    let store = shared_store(&clock);
    let conn = open_db_in_memory().unwrap();
    let service = build_service(&conn, &store, &clock);
    let voucher_id = service.create_voucher(&day_voucher(10)).unwrap();

    let err = service
        .place_order(&RequestContext::for_user(9), voucher_id)
        .unwrap_err();
    assert!(matches!(err, SeckillError::Ended { .. }));
    assert_eq!(err.code(), "seckill_ended");
    assert_eq!(service.sold_count(voucher_id).unwrap(), 0);
}

#[test]
fn unknown_voucher_is_reported() {
    let clock = Arc::new(ManualClock::new(at(1, 12, 0)));
    let store = shared_store(&clock);
    let conn = open_db_in_memory().unwrap();
    let service = build_service(&conn, &store, &clock);

    let err = service
        .place_order(&RequestContext::for_user(1), 4242)
        .unwrap_err();
    assert!(matches!(err, SeckillError::VoucherNotFound(4242)));
    assert!(err.is_business_outcome());
}

#[test]
fn same_user_cannot_buy_twice() {
    let clock = Arc::new(ManualClock::new(at(1, 12, 0)));
    let store = shared_store(&clock);
    let conn = open_db_in_memory().unwrap();
    let service = build_service(&conn, &store, &clock);
    let voucher_id = service.create_voucher(&day_voucher(5)).unwrap();
    let ctx = RequestContext::for_user(77);

    service.place_order(&ctx, voucher_id).unwrap();
    let err = service.place_order(&ctx, voucher_id).unwrap_err();
    assert!(matches!(
        err,
        SeckillError::AlreadyPurchased {
            user_id: 77,
            ..
        }
    ));

    let repo = SqliteVoucherRepository::try_new(&conn).unwrap();
    assert_eq!(repo.get_voucher(voucher_id).unwrap().unwrap().stock, 4);
    assert_eq!(repo.count_orders(voucher_id).unwrap(), 1);
    // The per-user lock was released on both paths.
    assert_eq!(store.get("lock:order-77").unwrap(), None);
}

#[test]
fn in_flight_request_of_same_user_is_turned_away() {
    let clock = Arc::new(ManualClock::new(at(1, 12, 0)));
    let store = shared_store(&clock);
    let conn = open_db_in_memory().unwrap();
    let service = build_service(&conn, &store, &clock);
    let voucher_id = service.create_voucher(&day_voucher(5)).unwrap();

    let mutex = DistributedMutex::new(store.clone());
    let other_request = LockOwner::for_task("other-request");
    assert!(mutex
        .try_acquire("order-5", Duration::from_secs(10), &other_request)
        .unwrap());

    let err = service
        .place_order(&RequestContext::for_user(5), voucher_id)
        .unwrap_err();
    assert!(matches!(err, SeckillError::LockUnavailable(_)));
    assert_eq!(err.code(), "lock_unavailable");
    assert_eq!(
        store.get("lock:order-5").unwrap().as_deref(),
        Some(other_request.token())
    );
    assert_eq!(service.sold_count(voucher_id).unwrap(), 0);

    // Once the lease runs out the user may order again.
    clock.advance(Duration::from_secs(11));
    service
        .place_order(&RequestContext::for_user(5), voucher_id)
        .unwrap();
}

#[test]
fn outcome_codes_are_distinct() {
    let errors = [
        SeckillError::VoucherNotFound(1),
        SeckillError::NotStarted {
            voucher_id: 1,
            begin_time: at(1, 0, 0),
        },
        SeckillError::Ended {
            voucher_id: 1,
            end_time: at(2, 0, 0),
        },
        SeckillError::SoldOut(1),
        SeckillError::AlreadyPurchased {
            voucher_id: 1,
            user_id: 1,
        },
        SeckillError::LockUnavailable("order-1".into()),
    ];
    let codes: HashSet<_> = errors.iter().map(SeckillError::code).collect();
    assert_eq!(codes.len(), errors.len());
    assert!(errors.iter().all(SeckillError::is_business_outcome));

    let outage = SeckillError::from(storefront_core::KvError::Backend("down".into()));
    assert!(!outage.is_business_outcome());
}

#[test]
fn voucher_update_is_visible_through_cache() {
    let clock = Arc::new(ManualClock::new(at(1, 12, 0)));
    let store = shared_store(&clock);
    let conn = open_db_in_memory().unwrap();
    let service = build_service(&conn, &store, &clock);
    let voucher_id = service.create_voucher(&day_voucher(0)).unwrap();

    let cached = service.get_voucher(voucher_id).unwrap();
    assert_eq!(cached.stock, 0);
    let err = service
        .place_order(&RequestContext::for_user(1), voucher_id)
        .unwrap_err();
    assert!(matches!(err, SeckillError::SoldOut(_)));

    service
        .update_voucher(&SeckillVoucher {
            stock: 3,
            ..cached
        })
        .unwrap();
    assert_eq!(service.get_voucher(voucher_id).unwrap().stock, 3);
    service
        .place_order(&RequestContext::for_user(1), voucher_id)
        .unwrap();
}

#[test]
fn invalid_voucher_is_rejected_as_malformed() {
    let clock = Arc::new(ManualClock::new(at(1, 12, 0)));
    let store = shared_store(&clock);
    let conn = open_db_in_memory().unwrap();
    let service = build_service(&conn, &store, &clock);

    let backwards = SeckillVoucher::new("broken", 1, at(2, 0, 0), at(1, 0, 0));
    assert!(matches!(
        service.create_voucher(&backwards),
        Err(SeckillError::Malformed(_))
    ));
}

#[test]
fn repository_decrement_never_goes_negative() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteVoucherRepository::try_new(&conn).unwrap();
    let id = repo.create_voucher(&day_voucher(2)).unwrap();

    assert!(repo.try_decrement_stock(id).unwrap());
    assert!(repo.try_decrement_stock(id).unwrap());
    assert!(!repo.try_decrement_stock(id).unwrap());
    assert_eq!(repo.get_voucher(id).unwrap().unwrap().stock, 0);
}

#[test]
fn failed_transaction_rolls_back_decrement() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteVoucherRepository::try_new(&conn).unwrap();
    let id = repo.create_voucher(&day_voucher(2)).unwrap();

    let result: Result<(), storefront_core::RepoError> = repo.in_transaction(|repo| {
        assert!(repo.try_decrement_stock(id)?);
        Err(storefront_core::RepoError::Conflict("abort".into()))
    });
    assert!(result.is_err());
    assert_eq!(repo.get_voucher(id).unwrap().unwrap().stock, 2);
}

#[test]
fn concurrent_buyers_never_oversell() {
    const BUYERS: usize = 24;
    const STOCK: i64 = 7;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seckill.db");
    let clock = Arc::new(ManualClock::new(at(1, 12, 0)));
    let store = shared_store(&clock);

    let voucher_id = {
        let conn = open_db(&path).unwrap();
        build_service(&conn, &store, &clock)
            .create_voucher(&day_voucher(STOCK))
            .unwrap()
    };

    let barrier = Arc::new(Barrier::new(BUYERS));
    let handles: Vec<_> = (1..=BUYERS as i64)
        .map(|user_id| {
            let path = path.clone();
            let store = Arc::clone(&store);
            let clock = Arc::clone(&clock);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let conn = open_db(&path).unwrap();
                let service = build_service(&conn, &store, &clock);
                barrier.wait();
                service
                    .place_order(&RequestContext::for_user(user_id), voucher_id)
                    .map_err(|err| err.code())
            })
        })
        .collect();

    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let order_ids: HashSet<u64> = outcomes.iter().filter_map(|o| o.ok()).collect();
    let sold_out = outcomes
        .iter()
        .filter(|o| matches!(o, Err("seckill_sold_out")))
        .count();
    assert_eq!(order_ids.len(), STOCK as usize);
    assert_eq!(sold_out, BUYERS - STOCK as usize);

    let conn = open_db(&path).unwrap();
    let repo = SqliteVoucherRepository::try_new(&conn).unwrap();
    assert_eq!(repo.get_voucher(voucher_id).unwrap().unwrap().stock, 0);
    assert_eq!(repo.count_orders(voucher_id).unwrap(), STOCK as u64);
}

#[test]
fn order_id_collision_is_an_infrastructure_failure() {
    let clock = Arc::new(ManualClock::new(at(1, 12, 0)));
    let store = shared_store(&clock);
    let conn = open_db_in_memory().unwrap();
    let service = build_service(&conn, &store, &clock);
    let voucher_id = service.create_voucher(&day_voucher(5)).unwrap();

    service
        .place_order(&RequestContext::for_user(1), voucher_id)
        .unwrap();
    // Counter lost (for example a store failover): the next id repeats.
    assert!(store.delete("seq:order:2024:01:01").unwrap());

    let err = service
        .place_order(&RequestContext::for_user(2), voucher_id)
        .unwrap_err();
    assert!(matches!(
        err,
        SeckillError::Repo(storefront_core::RepoError::DuplicateKey(_))
    ));
    assert_eq!(err.code(), "infrastructure_failure");
    assert!(!err.is_business_outcome());

    let repo = SqliteVoucherRepository::try_new(&conn).unwrap();
    assert_eq!(repo.get_voucher(voucher_id).unwrap().unwrap().stock, 4);
    assert_eq!(repo.count_orders(voucher_id).unwrap(), 1);
    assert!(repo.find_order(voucher_id, 2).unwrap().is_none());
}

#[test]
fn repository_separates_buyer_conflict_from_id_collision() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteVoucherRepository::try_new(&conn).unwrap();
    let voucher_id = repo.create_voucher(&day_voucher(5)).unwrap();
    let order = |id: u64, user_id: i64| storefront_core::VoucherOrder {
        id,
        user_id,
        voucher_id,
        created_at: at(1, 12, 0),
    };

    repo.insert_order(&order(100, 1)).unwrap();
    assert!(matches!(
        repo.insert_order(&order(101, 1)),
        Err(storefront_core::RepoError::Conflict(_))
    ));
    assert!(matches!(
        repo.insert_order(&order(100, 2)),
        Err(storefront_core::RepoError::DuplicateKey(_))
    ));
}

#[test]
fn order_lock_is_scoped_to_the_user_across_vouchers() {
    let clock = Arc::new(ManualClock::new(at(1, 12, 0)));
    let store = shared_store(&clock);
    let conn = open_db_in_memory().unwrap();
    let service = build_service(&conn, &store, &clock);
    let lunch = service.create_voucher(&day_voucher(5)).unwrap();
    let dinner = service
        .create_voucher(&SeckillVoucher::new("Dinner set", 5, at(1, 0, 0), at(2, 0, 0)))
        .unwrap();

    // An order of user 8 for `lunch` is still in flight.
    let mutex = DistributedMutex::new(store.clone());
    let in_flight = LockOwner::for_task("lunch-order");
    assert!(mutex
        .try_acquire("order-8", Duration::from_secs(10), &in_flight)
        .unwrap());
    let err = service
        .place_order(&RequestContext::for_user(8), dinner)
        .unwrap_err();
    assert!(matches!(err, SeckillError::LockUnavailable(_)));

    // Other users are unaffected.
    service
        .place_order(&RequestContext::for_user(9), dinner)
        .unwrap();

    assert!(mutex.release("order-8", &in_flight).unwrap());
    let ctx = RequestContext::for_user(8);
    service.place_order(&ctx, lunch).unwrap();
    service.place_order(&ctx, dinner).unwrap();
    assert_eq!(service.sold_count(dinner).unwrap(), 2);
}
