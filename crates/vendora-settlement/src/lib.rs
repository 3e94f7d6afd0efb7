use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;
use vendora_core::{CommerceResult, OrderStatus, SettlementStatus};

/// Orders delivered before this instant have cleared the cooling-off window.
pub fn eligibility_cutoff(now: DateTime<Utc>, hold_days: i64) -> DateTime<Utc> {
    now - Duration::days(hold_days.max(0))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub promoted: u64,
    pub settled: u64,
    pub skipped: u64,
}

impl CycleReport {
    /// Phase-2 accounting: a settle attempt either flipped the row here or
    /// found a concurrent cycle had settled it first.
    pub fn record_settle(&mut self, flipped: bool) {
        if flipped {
            self.settled += 1;
        } else {
            self.skipped += 1;
        }
    }
}

/// Ages confirmed-and-delivered orders into vendor payouts. Phase 1 is one
/// bulk conditional promote; phase 2 settles each eligible row behind a
/// status CAS so two overlapping cycles cannot pay a vendor twice.
#[derive(Clone)]
pub struct SettlementEngine {
    pool: PgPool,
    hold_days: i64,
}

impl SettlementEngine {
    pub fn new(pool: PgPool, hold_days: i64) -> Self {
        Self { pool, hold_days }
    }

    pub async fn run_cycle(&self) -> CommerceResult<CycleReport> {
        let promoted = self.promote_eligible().await?;
        let mut report = CycleReport {
            promoted,
            ..CycleReport::default()
        };

        let eligible = sqlx::query(
            "SELECT id, vendor_id, amount FROM order_settlements WHERE status = $1",
        )
        .bind(SettlementStatus::Eligible.as_str())
        .fetch_all(&self.pool)
        .await?;

        for row in eligible {
            let settlement_id: Uuid = row.try_get("id")?;
            let vendor_id: Uuid = row.try_get("vendor_id")?;
            let amount: i64 = row.try_get("amount")?;

            let flipped = self.settle_one(settlement_id, vendor_id, amount).await?;
            report.record_settle(flipped);
        }

        if report != CycleReport::default() {
            info!(
                promoted = report.promoted,
                settled = report.settled,
                skipped = report.skipped,
                "settlement cycle finished"
            );
        }
        Ok(report)
    }

    async fn promote_eligible(&self) -> CommerceResult<u64> {
        let now = Utc::now();
        let promoted = sqlx::query(
            r#"
            UPDATE order_settlements s
            SET status = $3, eligible_at = $1
            FROM orders o
            WHERE o.id = s.order_id
              AND s.status = $4
              AND o.status = $5
              AND o.delivered_at < $2
            "#,
        )
        .bind(now)
        .bind(eligibility_cutoff(now, self.hold_days))
        .bind(SettlementStatus::Eligible.as_str())
        .bind(SettlementStatus::Pending.as_str())
        .bind(OrderStatus::Delivered.as_str())
        .execute(&self.pool)
        .await?;
        Ok(promoted.rows_affected())
    }

    /// Returns false when a concurrent cycle settled the row first.
    async fn settle_one(
        &self,
        settlement_id: Uuid,
        vendor_id: Uuid,
        amount: i64,
    ) -> CommerceResult<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query(
            r#"
            UPDATE order_settlements SET status = $3, settled_at = $2
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(settlement_id)
        .bind(now)
        .bind(SettlementStatus::Settled.as_str())
        .bind(SettlementStatus::Eligible.as_str())
        .execute(&mut *tx)
        .await?;

        if flipped.rows_affected() == 0 {
            warn!(%settlement_id, "settlement already processed by a concurrent run");
            return Ok(false);
        }

        sqlx::query("UPDATE vendors SET pending_earnings = pending_earnings + $2 WHERE id = $1")
            .bind(vendor_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO vendor_payouts (id, settlement_id, vendor_id, amount, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(settlement_id)
        .bind(vendor_id)
        .bind(amount)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cutoff_is_hold_days_back() {
        let now = Utc.with_ymd_and_hms(2026, 8, 26, 12, 0, 0).unwrap();
        let cutoff = eligibility_cutoff(now, 7);
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2026, 8, 19, 12, 0, 0).unwrap());
    }

    #[test]
    fn negative_hold_does_not_move_the_cutoff_forward() {
        let now = Utc::now();
        assert_eq!(eligibility_cutoff(now, -3), now);
    }

    #[test]
    fn settle_accounting_counts_each_attempt_exactly_once() {
        let mut report = CycleReport {
            promoted: 3,
            ..CycleReport::default()
        };
        // Two rows flipped by this cycle, one lost to a concurrent cycle.
        report.record_settle(true);
        report.record_settle(false);
        report.record_settle(true);

        assert_eq!(report.settled, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.settled + report.skipped, 3);
    }
}
