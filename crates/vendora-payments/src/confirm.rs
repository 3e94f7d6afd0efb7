use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{error, info, warn};
use uuid::Uuid;
use vendora_coins::CoinLedger;
use vendora_core::{CommerceError, CommerceResult, OrderStatus, PaymentStatus};
use vendora_inventory::reservation::{counter_key, release_counter};
use vendora_platform::{KvStore, OrderConfirmedEvent, RedisBus};

use crate::signature::verify_confirmation;

const PROCESSING: &str = "processing";
const PROCESSING_TTL: Duration = Duration::from_secs(60);
const COMPLETED_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const REFERRAL_REWARD_COINS: i64 = 50;

pub(crate) fn confirm_key(provider_order_ref: &str, payment_id: &str) -> String {
    format!("confirm_order:{provider_order_ref}:{payment_id}")
}

fn encode_completed(order_ids: &[Uuid]) -> String {
    let joined: Vec<String> = order_ids.iter().map(Uuid::to_string).collect();
    format!("completed:{}", joined.join(","))
}

fn parse_completed(value: &str) -> Option<Vec<Uuid>> {
    let rest = value.strip_prefix("completed:")?;
    if rest.is_empty() {
        return Some(Vec::new());
    }
    rest.split(',')
        .map(|raw| Uuid::parse_str(raw).ok())
        .collect()
}

#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub order_ids: Vec<Uuid>,
    pub already_processed: bool,
}

struct ConfirmedOrder {
    id: Uuid,
    user_id: Uuid,
    vendor_id: Uuid,
    amount_payable: i64,
    confirmed_at: DateTime<Utc>,
    items: Vec<(Uuid, Option<Uuid>, i64)>,
}

/// Moves every order behind one provider payment from pending to confirmed
/// exactly once: idempotency marker in the fast store, then one durable
/// transaction covering the status flip, stock deduction, and coin debit,
/// then best-effort side effects that are never allowed to fail the
/// confirmation.
pub struct ConfirmationProtocol<S: KvStore> {
    pool: PgPool,
    kv: Arc<S>,
    coins: CoinLedger,
    bus: Option<RedisBus>,
    secret: String,
}

impl<S: KvStore> ConfirmationProtocol<S> {
    pub fn new(
        pool: PgPool,
        kv: Arc<S>,
        coins: CoinLedger,
        bus: Option<RedisBus>,
        secret: String,
    ) -> Self {
        Self {
            pool,
            kv,
            coins,
            bus,
            secret,
        }
    }

    pub async fn confirm(
        &self,
        provider_order_ref: &str,
        payment_id: &str,
        signature: &str,
    ) -> CommerceResult<ConfirmOutcome> {
        // Before any state is read, including the idempotency key.
        verify_confirmation(&self.secret, provider_order_ref, payment_id, signature)?;
        self.confirm_verified(provider_order_ref, payment_id).await
    }

    /// Entry point for callers that already authenticated the request, such as
    /// the webhook handler after verifying the raw-body signature.
    pub async fn confirm_verified(
        &self,
        provider_order_ref: &str,
        payment_id: &str,
    ) -> CommerceResult<ConfirmOutcome> {
        let key = confirm_key(provider_order_ref, payment_id);
        if let Some(value) = self.kv.get(&key).await? {
            if let Some(order_ids) = parse_completed(&value) {
                info!(provider_order_ref, payment_id, "confirmation replayed from marker");
                return Ok(ConfirmOutcome {
                    order_ids,
                    already_processed: true,
                });
            }
            if value == PROCESSING {
                return Err(CommerceError::AlreadyProcessing(format!(
                    "confirmation of {provider_order_ref} is in flight"
                )));
            }
        }
        if !self.kv.set_nx(&key, PROCESSING, PROCESSING_TTL).await? {
            return Err(CommerceError::AlreadyProcessing(format!(
                "confirmation of {provider_order_ref} is in flight"
            )));
        }

        match self.execute(provider_order_ref, payment_id).await {
            Ok((order_ids, confirmed)) => {
                self.side_effects(&confirmed).await;
                self.kv
                    .set(&key, &encode_completed(&order_ids), COMPLETED_TTL)
                    .await?;
                Ok(ConfirmOutcome {
                    order_ids,
                    already_processed: false,
                })
            }
            Err(err) => {
                // Leave the slot free for a retry.
                if let Err(cleanup) = self.kv.delete_if_eq(&key, PROCESSING).await {
                    error!("failed to clear processing marker: {cleanup:#}");
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        provider_order_ref: &str,
        payment_id: &str,
    ) -> CommerceResult<(Vec<Uuid>, Vec<ConfirmedOrder>)> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, vendor_id, status, amount_payable, coins_used, coins_debited
            FROM orders WHERE provider_order_ref = $1
            "#,
        )
        .bind(provider_order_ref)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(CommerceError::NotFound(format!(
                "orders for provider ref {provider_order_ref}"
            )));
        }

        let mut order_ids = Vec::with_capacity(rows.len());
        let mut all_paid = true;
        for row in &rows {
            order_ids.push(row.try_get::<Uuid, _>("id")?);
            let status = OrderStatus::parse(&row.try_get::<String, _>("status")?)?;
            if !status.is_paid_equivalent() {
                all_paid = false;
            }
        }
        if all_paid {
            info!(provider_order_ref, "all orders already paid, short-circuiting");
            return Ok((order_ids, Vec::new()));
        }

        let now = Utc::now();
        let pre_payment = OrderStatus::pre_payment_strings();
        let mut tx = self.pool.begin().await?;
        let mut confirmed = Vec::new();

        for row in &rows {
            let order_id: Uuid = row.try_get("id")?;
            let user_id: Uuid = row.try_get("user_id")?;
            let vendor_id: Uuid = row.try_get("vendor_id")?;
            let amount_payable: i64 = row.try_get("amount_payable")?;
            let coins_used: i64 = row.try_get("coins_used")?;

            let updated = sqlx::query(
                r#"
                UPDATE orders SET status = $2, confirmed_at = $3, updated_at = $3
                WHERE id = $1 AND status = ANY($4)
                "#,
            )
            .bind(order_id)
            .bind(OrderStatus::Confirmed.as_str())
            .bind(now)
            .bind(&pre_payment)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                // Another worker confirmed it, or the order was cancelled
                // before the callback arrived; either way it is not ours.
                warn!(%order_id, "order not in a confirmable status, skipping");
                continue;
            }

            let item_rows = sqlx::query(
                "SELECT product_id, variant_id, quantity FROM order_items WHERE order_id = $1",
            )
            .bind(order_id)
            .fetch_all(&mut *tx)
            .await?;

            let mut items = Vec::with_capacity(item_rows.len());
            for item in item_rows {
                let product_id: Uuid = item.try_get("product_id")?;
                let variant_id: Option<Uuid> = item.try_get("variant_id")?;
                let quantity: i64 = item.try_get("quantity")?;
                // Any failure here aborts the whole transaction; partial
                // deduction across an order's items is never durable.
                vendora_inventory::stock::deduct(&mut tx, product_id, quantity, variant_id)
                    .await?;
                items.push((product_id, variant_id, quantity));
            }

            sqlx::query("UPDATE orders SET stock_deducted = TRUE WHERE id = $1")
                .bind(order_id)
                .execute(&mut *tx)
                .await?;

            if coins_used > 0 {
                let flipped = sqlx::query(
                    "UPDATE orders SET coins_debited = TRUE WHERE id = $1 AND coins_debited = FALSE",
                )
                .bind(order_id)
                .execute(&mut *tx)
                .await?;

                // The flag flip is the debit's once-only guard; a retried
                // confirmation finds it set and never double-debits.
                if flipped.rows_affected() == 1 {
                    self.coins
                        .debit_in_tx(
                            &mut tx,
                            user_id,
                            coins_used,
                            "ORDER_REDEMPTION",
                            &order_id.to_string(),
                        )
                        .await?;
                }
            }

            confirmed.push(ConfirmedOrder {
                id: order_id,
                user_id,
                vendor_id,
                amount_payable,
                confirmed_at: now,
                items,
            });
        }

        sqlx::query(
            r#"
            UPDATE payments SET status = $2, provider_payment_id = $3, updated_at = $4
            WHERE provider_order_ref = $1 AND status = $5
            "#,
        )
        .bind(provider_order_ref)
        .bind(PaymentStatus::Success.as_str())
        .bind(payment_id)
        .bind(now)
        .bind(PaymentStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((order_ids, confirmed))
    }

    /// Everything after the commit is best-effort: tracked, logged, and never
    /// propagated back to the gateway callback.
    async fn side_effects(&self, confirmed: &[ConfirmedOrder]) {
        for order in confirmed {
            if let Some(bus) = &self.bus {
                let event = OrderConfirmedEvent {
                    order_id: order.id,
                    user_id: order.user_id,
                    vendor_id: order.vendor_id,
                    amount_payable: order.amount_payable,
                    confirmed_at: order.confirmed_at,
                };
                if let Err(err) = bus.publish_json("orders.confirmed", &event).await {
                    error!(order_id = %order.id, "order-confirmed publish failed: {err:#}");
                }
            }

            if let Err(err) = self
                .kv
                .delete(&format!("payment_timeout:{}", order.id))
                .await
            {
                error!(order_id = %order.id, "payment timeout clear failed: {err:#}");
            }

            for (product_id, variant_id, quantity) in &order.items {
                if let Err(err) = release_counter(
                    self.kv.as_ref(),
                    &counter_key(*product_id, *variant_id),
                    *quantity,
                )
                .await
                {
                    error!(order_id = %order.id, "reservation release failed: {err:#}");
                }
            }

            if let Err(err) = self.reward_referrer(order).await {
                error!(order_id = %order.id, "referral reward failed: {err:#}");
            }
        }
    }

    /// Idempotent per order: the credit reference is derived from the order
    /// id, so webhook redelivery cannot double-reward.
    async fn reward_referrer(&self, order: &ConfirmedOrder) -> CommerceResult<()> {
        let row = sqlx::query("SELECT referred_by FROM users WHERE id = $1")
            .bind(order.user_id)
            .fetch_optional(&self.pool)
            .await?;

        let referrer: Option<Uuid> = match row {
            Some(row) => row.try_get("referred_by")?,
            None => None,
        };
        let Some(referrer) = referrer else {
            return Ok(());
        };

        self.coins
            .credit(
                referrer,
                REFERRAL_REWARD_COINS,
                "REFERRAL_REWARD",
                Some(&format!("referral:{}", order.id)),
                None,
            )
            .await?;
        Ok(())
    }

    /// `payment.failed` path: fail the payment row, cancel orders still
    /// waiting on it, release their reservations.
    pub async fn mark_failed(
        &self,
        provider_order_ref: &str,
        payment_id: &str,
    ) -> CommerceResult<Vec<Uuid>> {
        let now = Utc::now();
        let pre_payment = OrderStatus::pre_payment_strings();
        sqlx::query(
            r#"
            UPDATE payments SET status = $2, provider_payment_id = $3, updated_at = $4
            WHERE provider_order_ref = $1 AND status = $5
            "#,
        )
        .bind(provider_order_ref)
        .bind(PaymentStatus::Failed.as_str())
        .bind(payment_id)
        .bind(now)
        .bind(PaymentStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        let rows = sqlx::query(
            "SELECT id FROM orders WHERE provider_order_ref = $1 AND status = ANY($2)",
        )
        .bind(provider_order_ref)
        .bind(&pre_payment)
        .fetch_all(&self.pool)
        .await?;

        let mut cancelled = Vec::new();
        for row in rows {
            let order_id: Uuid = row.try_get("id")?;
            let updated = sqlx::query(
                r#"
                UPDATE orders SET status = $2, updated_at = $3
                WHERE id = $1 AND status = ANY($4)
                "#,
            )
            .bind(order_id)
            .bind(OrderStatus::Cancelled.as_str())
            .bind(now)
            .bind(&pre_payment)
            .execute(&self.pool)
            .await?;
            if updated.rows_affected() == 0 {
                continue;
            }
            cancelled.push(order_id);

            let items = sqlx::query(
                "SELECT product_id, variant_id, quantity FROM order_items WHERE order_id = $1",
            )
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;
            for item in items {
                let product_id: Uuid = item.try_get("product_id")?;
                let variant_id: Option<Uuid> = item.try_get("variant_id")?;
                let quantity: i64 = item.try_get("quantity")?;
                if let Err(err) = release_counter(
                    self.kv.as_ref(),
                    &counter_key(product_id, variant_id),
                    quantity,
                )
                .await
                {
                    error!(%order_id, "reservation release failed: {err:#}");
                }
            }
        }

        info!(provider_order_ref, count = cancelled.len(), "payment failure handled");
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::sign_confirmation;
    use vendora_core::ErrorKind;
    use vendora_platform::MemoryKv;

    const SECRET: &str = "test-webhook-secret";

    fn protocol(kv: Arc<MemoryKv>) -> ConfirmationProtocol<MemoryKv> {
        // Lazy pool: no connection is made until a query runs, and the paths
        // under test must return before any query does.
        let pool = PgPool::connect_lazy("postgres://localhost/vendora_test").unwrap();
        let coins = CoinLedger::new(pool.clone());
        ConfirmationProtocol::new(pool, kv, coins, None, SECRET.to_string())
    }

    #[test]
    fn completed_marker_round_trips() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let encoded = encode_completed(&ids);
        assert_eq!(parse_completed(&encoded), Some(ids));
        assert_eq!(parse_completed("completed:"), Some(Vec::new()));
        assert_eq!(parse_completed(PROCESSING), None);
        assert_eq!(parse_completed("completed:not-a-uuid"), None);
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected_before_any_state_read() {
        let kv = Arc::new(MemoryKv::new());
        let protocol = protocol(kv.clone());

        let signature = sign_confirmation(SECRET, "ord_1", "pay_1").unwrap();
        let err = protocol
            .confirm("ord_1", "pay_2", &signature)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
        // Not even the idempotency key was touched.
        assert_eq!(kv.get(&confirm_key("ord_1", "pay_2")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_confirmation_replays_the_completed_marker() {
        let kv = Arc::new(MemoryKv::new());
        let order_ids = vec![Uuid::new_v4()];
        kv.set(
            &confirm_key("ord_1", "pay_1"),
            &encode_completed(&order_ids),
            COMPLETED_TTL,
        )
        .await
        .unwrap();

        let protocol = protocol(kv);
        let signature = sign_confirmation(SECRET, "ord_1", "pay_1").unwrap();
        let outcome = protocol.confirm("ord_1", "pay_1", &signature).await.unwrap();
        assert!(outcome.already_processed);
        assert_eq!(outcome.order_ids, order_ids);
    }

    #[tokio::test]
    async fn in_flight_confirmation_is_a_conflict() {
        let kv = Arc::new(MemoryKv::new());
        kv.set(&confirm_key("ord_1", "pay_1"), PROCESSING, PROCESSING_TTL)
            .await
            .unwrap();

        let protocol = protocol(kv);
        let signature = sign_confirmation(SECRET, "ord_1", "pay_1").unwrap();
        let err = protocol
            .confirm("ord_1", "pay_1", &signature)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(matches!(err, CommerceError::AlreadyProcessing(_)));
    }
}
