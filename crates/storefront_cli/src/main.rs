//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `storefront_core` linkage and run one seckill round against
//!   in-process stores.
//! - Keep output line-oriented for quick local sanity checks.
//!
//! Usage: `storefront_cli [absolute-log-dir]`

use chrono::Duration;
use log::error;
use std::process::ExitCode;
use std::sync::Arc;
use storefront_core::db::open_db_in_memory;
use storefront_core::{
    default_log_level, init_logging, Clock, CoreConfig, DistributedMutex, EntityCache, IdWorker,
    KvStore, MemoryKvStore, RequestContext, SeckillVoucher, SqliteVoucherRepository, SystemClock,
    VoucherOrderService, VOUCHER_ENTITY,
};

fn main() -> ExitCode {
    println!("storefront_core ping={}", storefront_core::ping());
    println!("storefront_core version={}", storefront_core::core_version());

    if let Some(log_dir) = std::env::args().nth(1) {
        if let Err(err) = init_logging(default_log_level(), &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    match run_seckill_round() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_smoke module=cli status=error error={err}");
            eprintln!("smoke run failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run_seckill_round() -> Result<(), Box<dyn std::error::Error>> {
    let config = CoreConfig::default();
    config.validate()?;
    let conn = open_db_in_memory()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::with_clock(Arc::clone(&clock)));

    let service = VoucherOrderService::new(
        SqliteVoucherRepository::try_new(&conn)?,
        EntityCache::with_ttls(
            Arc::clone(&store),
            VOUCHER_ENTITY,
            config.cache_ttl(),
            config.null_ttl(),
        ),
        DistributedMutex::new(Arc::clone(&store)),
        IdWorker::with_epoch(Arc::clone(&store), Arc::clone(&clock), config.id_epoch_secs),
        Arc::clone(&clock),
    )
    .with_lock_ttl(config.order_lock_ttl());

    let now = clock.now();
    let voucher_id = service.create_voucher(&SeckillVoucher::new(
        "smoke voucher",
        1,
        now - Duration::hours(1),
        now + Duration::hours(1),
    ))?;
    println!("voucher id={voucher_id} stock=1");

    for user_id in [1, 2] {
        match service.place_order(&RequestContext::for_user(user_id), voucher_id) {
            Ok(order_id) => println!("user={user_id} status=ok order_id={order_id}"),
            Err(err) if err.is_business_outcome() => {
                println!("user={user_id} status=rejected code={}", err.code())
            }
            Err(err) => return Err(err.into()),
        }
    }
    println!("sold={}", service.sold_count(voucher_id)?);
    Ok(())
}
