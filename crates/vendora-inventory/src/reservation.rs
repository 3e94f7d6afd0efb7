use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;
use vendora_core::{CommerceError, CommerceResult};
use vendora_platform::KvStore;

use crate::stock::available_stock;

pub fn counter_key(product_id: Uuid, variant_id: Option<Uuid>) -> String {
    match variant_id {
        Some(variant_id) => format!("reservation:{product_id}:{variant_id}"),
        None => format!("reservation:{product_id}:base"),
    }
}

/// Soft, expiring holds on stock taken at checkout, backed by fast-store
/// counters and reconciled against durable product stock. Counters are the
/// only hot shared resource on the checkout path; increments are lock-free
/// with a post-hoc verify instead of a mutex.
pub struct ReservationLedger<S: KvStore> {
    pool: PgPool,
    kv: Arc<S>,
    ttl: Duration,
}

impl<S: KvStore> ReservationLedger<S> {
    pub fn new(pool: PgPool, kv: Arc<S>, ttl: Duration) -> Self {
        Self { pool, kv, ttl }
    }

    pub fn kv(&self) -> &S {
        self.kv.as_ref()
    }

    pub async fn reserve(
        &self,
        product_id: Uuid,
        qty: i64,
        variant_id: Option<Uuid>,
    ) -> CommerceResult<()> {
        if qty <= 0 {
            return Err(CommerceError::Validation(
                "reservation quantity must be positive".into(),
            ));
        }
        let stock = available_stock(&self.pool, product_id, variant_id).await?;
        reserve_counter(
            self.kv.as_ref(),
            &counter_key(product_id, variant_id),
            stock,
            qty,
            self.ttl,
            product_id,
            variant_id,
        )
        .await
    }

    pub async fn release(
        &self,
        product_id: Uuid,
        qty: i64,
        variant_id: Option<Uuid>,
    ) -> CommerceResult<()> {
        if qty <= 0 {
            return Ok(());
        }
        release_counter(self.kv.as_ref(), &counter_key(product_id, variant_id), qty).await
    }

    pub async fn reserved(
        &self,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> CommerceResult<i64> {
        let raw = self.kv.get(&counter_key(product_id, variant_id)).await?;
        Ok(raw.and_then(|value| value.parse().ok()).unwrap_or(0))
    }
}

/// Two-phase reserve: pre-check against `stock - reserved`, atomic increment,
/// then verify the post-increment total. A verify failure means another
/// reservation won the race; back the increment out and report the conflict.
/// The ttl is refreshed on every successful reserve.
pub async fn reserve_counter<S: KvStore>(
    kv: &S,
    key: &str,
    stock: i64,
    qty: i64,
    ttl: Duration,
    product_id: Uuid,
    variant_id: Option<Uuid>,
) -> CommerceResult<()> {
    let reserved: i64 = kv
        .get(key)
        .await?
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);

    if stock - reserved < qty {
        return Err(CommerceError::InsufficientStock {
            product_id,
            variant_id,
            requested: qty,
            available: (stock - reserved).max(0),
        });
    }

    let new_reserved = kv.incr_by(key, qty).await?;
    if new_reserved > stock {
        kv.incr_by(key, -qty).await?;
        return Err(CommerceError::InsufficientStock {
            product_id,
            variant_id,
            requested: qty,
            available: (stock - (new_reserved - qty)).max(0),
        });
    }

    kv.expire(key, ttl).await?;
    Ok(())
}

/// Decrement, floored at zero; releasing more than is held (a late release
/// after the counter expired) must not open negative headroom.
pub async fn release_counter<S: KvStore>(kv: &S, key: &str, qty: i64) -> CommerceResult<()> {
    let remaining = kv.incr_by(key, -qty).await?;
    if remaining < 0 {
        kv.incr_by(key, -remaining).await?;
    }
    Ok(())
}
