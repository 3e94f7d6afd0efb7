use std::time::Duration;

use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;
use vendora_core::{CommerceResult, OrderStatus};
use vendora_platform::KvStore;

use crate::reservation::{ReservationLedger, counter_key, release_counter};

/// Cancels checkouts abandoned in a pre-payment status for longer than
/// `max_age` (callers pass the payment window, so an in-flight payment is
/// never swept) and releases their counters, so abandoned carts cannot lock
/// up stock. The counters' own ttl bounds any leak a missed release leaves
/// behind. Idempotent; the cancel is a count-checked update.
pub async fn run_reservation_sweep<S: KvStore>(
    pool: &PgPool,
    ledger: &ReservationLedger<S>,
    max_age: Duration,
) -> CommerceResult<u64> {
    let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::minutes(30));
    let pre_payment = OrderStatus::pre_payment_strings();

    let stale = sqlx::query(
        "SELECT id FROM orders WHERE status = ANY($2) AND created_at < $1",
    )
    .bind(cutoff)
    .bind(&pre_payment)
    .fetch_all(pool)
    .await?;

    let mut cancelled = 0u64;
    for row in stale {
        let order_id: Uuid = row.try_get("id")?;

        let updated = sqlx::query(
            r#"
            UPDATE orders SET status = $2, updated_at = $3
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(order_id)
        .bind(OrderStatus::Cancelled.as_str())
        .bind(Utc::now())
        .bind(&pre_payment)
        .execute(pool)
        .await?;

        if updated.rows_affected() == 0 {
            continue;
        }
        cancelled += 1;

        let items = sqlx::query(
            "SELECT product_id, variant_id, quantity FROM order_items WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_all(pool)
        .await?;

        for item in items {
            let product_id: Uuid = item.try_get("product_id")?;
            let variant_id: Option<Uuid> = item.try_get("variant_id")?;
            let quantity: i64 = item.try_get("quantity")?;
            release_counter(ledger.kv(), &counter_key(product_id, variant_id), quantity).await?;
        }
    }

    if cancelled > 0 {
        info!(cancelled, "reservation sweep released stale checkouts");
    }
    Ok(cancelled)
}
