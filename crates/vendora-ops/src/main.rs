use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};
use vendora_coins::CoinLedger;
use vendora_inventory::{ReservationLedger, run_reservation_sweep};
use vendora_locks::LockManager;
use vendora_platform::{RedisKv, ServiceConfig, connect_database};
use vendora_settlement::SettlementEngine;

const RESERVATION_SWEEP_EVERY: Duration = Duration::from_secs(60);
const COIN_EXPIRY_EVERY: Duration = Duration::from_secs(15 * 60);
const SETTLEMENT_EVERY: Duration = Duration::from_secs(60 * 60);
const JOB_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vendora_ops=info".to_string()),
        )
        .init();

    let config = ServiceConfig::worker_from_env()?;
    let pool = connect_database(&config.database_url, config.db_pool_size).await?;
    let kv = Arc::new(RedisKv::connect(&config.redis_url)?);

    let locks = Arc::new(LockManager::new(kv.clone()));
    let coins = CoinLedger::new(pool.clone());
    let reservations = Arc::new(ReservationLedger::new(
        pool.clone(),
        kv.clone(),
        Duration::from_secs(config.reservation_ttl_secs),
    ));
    let settlement = SettlementEngine::new(pool.clone(), config.settlement_hold_days);
    // Abandoned checkouts are cancelled only once their payment window has
    // lapsed, so a sweep can never race a payment still in flight.
    let sweep_age = Duration::from_secs(config.payment_timeout_secs);

    info!("ops worker started");

    let reservation_job = {
        let pool = pool.clone();
        let locks = locks.clone();
        let reservations = reservations.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESERVATION_SWEEP_EVERY);
            loop {
                ticker.tick().await;
                let outcome = locks
                    .with_lock("lock:reservation_sweep", JOB_LOCK_TTL, || async {
                        run_reservation_sweep(&pool, &reservations, sweep_age)
                            .await
                            .map_err(anyhow::Error::from)
                    })
                    .await;
                if let Err(err) = outcome {
                    error!("reservation sweep failed: {err:#}");
                }
            }
        })
    };

    let coin_job = {
        let locks = locks.clone();
        let coins = coins.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(COIN_EXPIRY_EVERY);
            loop {
                ticker.tick().await;
                let outcome = locks
                    .with_lock("lock:coin_expiry_sweep", JOB_LOCK_TTL, || async {
                        coins.expire_sweep().await.map_err(anyhow::Error::from)
                    })
                    .await;
                if let Err(err) = outcome {
                    error!("coin expiry sweep failed: {err:#}");
                }
            }
        })
    };

    let settlement_job = {
        let locks = locks.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SETTLEMENT_EVERY);
            loop {
                ticker.tick().await;
                let outcome = locks
                    .with_lock("lock:settlement_cycle", JOB_LOCK_TTL, || async {
                        settlement.run_cycle().await.map_err(anyhow::Error::from)
                    })
                    .await;
                if let Err(err) = outcome {
                    error!("settlement cycle failed: {err:#}");
                }
            }
        })
    };

    let _ = tokio::try_join!(reservation_job, coin_job, settlement_job)?;
    Ok(())
}
