use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;
use vendora_core::{CommerceError, CommerceResult, UserRole};

/// Minor units per coin when no valuation row exists yet.
pub const DEFAULT_VALUATION: i64 = 100;

/// Spendable balance as a pure fold of ledger entries `(amount, is_expired)`:
/// unexpired credits plus all debits, clamped at zero. The cached balance on
/// the user row is a projection of this, never the source of truth.
pub fn spendable_balance<I>(entries: I) -> i64
where
    I: IntoIterator<Item = (i64, bool)>,
{
    let sum: i64 = entries
        .into_iter()
        .filter(|(amount, is_expired)| *amount < 0 || !is_expired)
        .map(|(amount, _)| amount)
        .sum();
    sum.max(0)
}

/// Admission check for a debit against the locked balance.
pub fn debit_guard(user_id: Uuid, balance: i64, amount: i64) -> CommerceResult<()> {
    if amount <= 0 {
        return Err(CommerceError::Validation(
            "debit amount must be positive".into(),
        ));
    }
    if balance < amount {
        return Err(CommerceError::InsufficientBalance {
            user_id,
            requested: amount,
            available: balance,
        });
    }
    Ok(())
}

/// Append-only coin accounting. Entries are never rewritten; the only
/// permitted mutation is flipping `is_expired`.
#[derive(Clone)]
pub struct CoinLedger {
    pool: PgPool,
}

impl CoinLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Credit coins. With a `reference_id` the call is idempotent: an existing
    /// `(user, reference, source)` credit makes this a no-op returning the
    /// current cached balance, which is what makes referral and reward credits
    /// safe to retry.
    pub async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        source: &str,
        reference_id: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> CommerceResult<i64> {
        if amount <= 0 {
            return Err(CommerceError::Validation(
                "credit amount must be positive".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let (role, balance) = lock_user(&mut tx, user_id).await?;

        // Checked under the user-row lock: a concurrent credit with the same
        // reference commits first or waits on the lock, so both sides see it.
        if let Some(reference_id) = reference_id {
            let duplicate = sqlx::query(
                r#"
                SELECT 1 AS present FROM coin_ledger
                WHERE user_id = $1 AND reference_id = $2 AND source = $3 AND amount > 0
                "#,
            )
            .bind(user_id)
            .bind(reference_id)
            .bind(source)
            .fetch_optional(&mut *tx)
            .await?;

            if duplicate.is_some() {
                info!(%user_id, reference_id, source, "duplicate credit skipped");
                return Ok(balance);
            }
        }

        let valuation = valuation_at(&mut tx, Utc::now()).await?;

        insert_entry(
            &mut tx,
            user_id,
            amount,
            source,
            reference_id,
            role,
            valuation,
            expires_at,
        )
        .await?;

        sqlx::query("UPDATE users SET coin_balance = coin_balance + $2 WHERE id = $1")
            .bind(user_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(balance + amount)
    }

    pub async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        source: &str,
        reference_id: &str,
    ) -> CommerceResult<i64> {
        let mut tx = self.pool.begin().await?;
        let balance = self
            .debit_in_tx(&mut tx, user_id, amount, source, reference_id)
            .await?;
        tx.commit().await?;
        Ok(balance)
    }

    /// Debit inside a caller-owned transaction; the confirmation protocol uses
    /// this so the ledger entry commits or aborts with the order updates.
    pub async fn debit_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        amount: i64,
        source: &str,
        reference_id: &str,
    ) -> CommerceResult<i64> {
        let (role, balance) = lock_user(tx, user_id).await?;
        debit_guard(user_id, balance, amount)?;

        let valuation = valuation_at(tx, Utc::now()).await?;
        insert_entry(
            tx,
            user_id,
            -amount,
            source,
            Some(reference_id),
            role,
            valuation,
            None,
        )
        .await?;

        sqlx::query("UPDATE users SET coin_balance = coin_balance - $2 WHERE id = $1")
            .bind(user_id)
            .bind(amount)
            .execute(&mut **tx)
            .await?;

        Ok(balance - amount)
    }

    /// Reconciliation primitive: recompute the spendable balance from the
    /// ledger and write it back to the cache. Safe to call at any time.
    pub async fn recalculate_balance(&self, user_id: Uuid) -> CommerceResult<i64> {
        let rows = sqlx::query("SELECT amount, is_expired FROM coin_ledger WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push((
                row.try_get::<i64, _>("amount")?,
                row.try_get::<bool, _>("is_expired")?,
            ));
        }
        let balance = spendable_balance(entries);

        sqlx::query("UPDATE users SET coin_balance = $2 WHERE id = $1")
            .bind(user_id)
            .bind(balance)
            .execute(&self.pool)
            .await?;

        Ok(balance)
    }

    /// Flip `is_expired` on lapsed credits (amounts stay untouched for the
    /// audit trail), then reconcile every affected user. Returns the number of
    /// entries expired.
    pub async fn expire_sweep(&self) -> CommerceResult<u64> {
        let expired = sqlx::query(
            r#"
            UPDATE coin_ledger SET is_expired = TRUE
            WHERE amount > 0 AND is_expired = FALSE
              AND expires_at IS NOT NULL AND expires_at < $1
            RETURNING user_id
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        let mut users: Vec<Uuid> = Vec::new();
        for row in &expired {
            let user_id: Uuid = row.try_get("user_id")?;
            if !users.contains(&user_id) {
                users.push(user_id);
            }
        }
        for user_id in users {
            self.recalculate_balance(user_id).await?;
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "coin expiry sweep flipped entries");
        }
        Ok(expired.len() as u64)
    }

    /// Valuation changes are future-dated only; past entries keep the
    /// valuation they snapshotted.
    pub async fn set_valuation(
        &self,
        minor_units_per_coin: i64,
        effective_from: DateTime<Utc>,
    ) -> CommerceResult<()> {
        if minor_units_per_coin <= 0 {
            return Err(CommerceError::Validation(
                "valuation must be positive".into(),
            ));
        }
        if effective_from <= Utc::now() {
            return Err(CommerceError::Validation(
                "valuation changes must be future-dated".into(),
            ));
        }

        sqlx::query(
            "INSERT INTO coin_valuations (id, minor_units_per_coin, effective_from) VALUES ($1, $2, $3)",
        )
        .bind(Uuid::new_v4())
        .bind(minor_units_per_coin)
        .bind(effective_from)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn current_valuation(&self) -> CommerceResult<i64> {
        let mut tx = self.pool.begin().await?;
        let valuation = valuation_at(&mut tx, Utc::now()).await?;
        tx.commit().await?;
        Ok(valuation)
    }

    pub async fn cached_balance(&self, user_id: Uuid) -> CommerceResult<i64> {
        let mut tx = self.pool.begin().await?;
        let balance = cached_balance(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(balance)
    }
}

async fn lock_user(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> CommerceResult<(UserRole, i64)> {
    let row = sqlx::query("SELECT role, coin_balance FROM users WHERE id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

    let Some(row) = row else {
        return Err(CommerceError::NotFound(format!("user {user_id}")));
    };
    let role: String = row.try_get("role")?;
    let balance: i64 = row.try_get("coin_balance")?;
    Ok((UserRole::parse(&role), balance))
}

async fn cached_balance(tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> CommerceResult<i64> {
    let row = sqlx::query("SELECT coin_balance FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else {
        return Err(CommerceError::NotFound(format!("user {user_id}")));
    };
    Ok(row.try_get("coin_balance")?)
}

async fn valuation_at(
    tx: &mut Transaction<'_, Postgres>,
    at: DateTime<Utc>,
) -> CommerceResult<i64> {
    let row = sqlx::query(
        r#"
        SELECT minor_units_per_coin FROM coin_valuations
        WHERE effective_from <= $1
        ORDER BY effective_from DESC
        LIMIT 1
        "#,
    )
    .bind(at)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some(row) => Ok(row.try_get("minor_units_per_coin")?),
        None => Ok(DEFAULT_VALUATION),
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    amount: i64,
    source: &str,
    reference_id: Option<&str>,
    role: UserRole,
    valuation: i64,
    expires_at: Option<DateTime<Utc>>,
) -> CommerceResult<()> {
    sqlx::query(
        r#"
        INSERT INTO coin_ledger (
            id, user_id, amount, source, reference_id,
            role_at_txn, valuation_at_txn, is_expired, expires_at, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, $8, $9)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(amount)
    .bind(source)
    .bind(reference_id)
    .bind(role.as_str())
    .bind(valuation)
    .bind(expires_at)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_is_credits_minus_debits() {
        let entries = vec![(100, false), (50, false), (-30, false)];
        assert_eq!(spendable_balance(entries), 120);
    }

    #[test]
    fn expired_credits_do_not_count() {
        let entries = vec![(100, true), (50, false), (-30, false)];
        assert_eq!(spendable_balance(entries), 20);
    }

    #[test]
    fn debits_count_even_when_flagged_expired() {
        // The expiry flag is only meaningful on credits; a debit row carrying
        // it must still reduce the balance.
        let entries = vec![(100, false), (-40, true)];
        assert_eq!(spendable_balance(entries), 60);
    }

    #[test]
    fn balance_clamps_at_zero() {
        let entries = vec![(100, true), (-30, false)];
        assert_eq!(spendable_balance(entries), 0);
        assert_eq!(spendable_balance(Vec::new()), 0);
    }

    #[test]
    fn zero_balance_debit_is_rejected() {
        let user_id = Uuid::new_v4();
        let err = debit_guard(user_id, 0, 50).unwrap_err();
        match err {
            CommerceError::InsufficientBalance {
                user_id: reported,
                requested,
                available,
            } => {
                assert_eq!(reported, user_id);
                assert_eq!(requested, 50);
                assert_eq!(available, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn debit_up_to_the_exact_balance_is_allowed() {
        let user_id = Uuid::new_v4();
        debit_guard(user_id, 50, 50).unwrap();
        assert!(debit_guard(user_id, 50, 51).is_err());
    }

    #[test]
    fn non_positive_debit_amounts_are_invalid() {
        let user_id = Uuid::new_v4();
        assert!(matches!(
            debit_guard(user_id, 100, 0),
            Err(CommerceError::Validation(_))
        ));
        assert!(matches!(
            debit_guard(user_id, 100, -5),
            Err(CommerceError::Validation(_))
        ));
    }
}
