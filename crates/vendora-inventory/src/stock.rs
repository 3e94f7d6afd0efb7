use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;
use vendora_core::{CommerceError, CommerceResult};

/// Durable stock for one product or one variant row. Variants are individual
/// rows, so aggregate product stock for variant products is a read-side sum,
/// never a stored value to rewrite.
pub async fn available_stock(
    pool: &PgPool,
    product_id: Uuid,
    variant_id: Option<Uuid>,
) -> CommerceResult<i64> {
    let row = match variant_id {
        Some(variant_id) => {
            sqlx::query("SELECT stock FROM product_variants WHERE id = $1 AND product_id = $2")
                .bind(variant_id)
                .bind(product_id)
                .fetch_optional(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT stock FROM products WHERE id = $1")
                .bind(product_id)
                .fetch_optional(pool)
                .await?
        }
    };

    let Some(row) = row else {
        return Err(CommerceError::NotFound(format!("product {product_id}")));
    };
    Ok(row.try_get("stock")?)
}

/// Final, durable deduction on payment confirmation. The decrement is
/// conditional on remaining stock; zero rows affected is a loud failure that
/// aborts the caller's transaction.
pub async fn deduct(
    tx: &mut Transaction<'_, Postgres>,
    product_id: Uuid,
    qty: i64,
    variant_id: Option<Uuid>,
) -> CommerceResult<()> {
    if qty <= 0 {
        return Err(CommerceError::Validation(
            "deduction quantity must be positive".into(),
        ));
    }

    let updated = match variant_id {
        Some(variant_id) => {
            sqlx::query(
                "UPDATE product_variants SET stock = stock - $3 WHERE id = $1 AND product_id = $2 AND stock >= $3",
            )
            .bind(variant_id)
            .bind(product_id)
            .bind(qty)
            .execute(&mut **tx)
            .await?
        }
        None => {
            sqlx::query("UPDATE products SET stock = stock - $2 WHERE id = $1 AND stock >= $2")
                .bind(product_id)
                .bind(qty)
                .execute(&mut **tx)
                .await?
        }
    };

    if updated.rows_affected() == 0 {
        let available = remaining_stock(tx, product_id, variant_id).await?;
        return Err(CommerceError::InsufficientStock {
            product_id,
            variant_id,
            requested: qty,
            available,
        });
    }
    Ok(())
}

/// Compensating increment used on cancellation. Callers gate on the order's
/// `stock_deducted` flag; restoring stock that was never deducted would mint
/// inventory.
pub async fn restore(
    tx: &mut Transaction<'_, Postgres>,
    product_id: Uuid,
    qty: i64,
    variant_id: Option<Uuid>,
) -> CommerceResult<()> {
    if qty <= 0 {
        return Ok(());
    }

    match variant_id {
        Some(variant_id) => {
            sqlx::query(
                "UPDATE product_variants SET stock = stock + $3 WHERE id = $1 AND product_id = $2",
            )
            .bind(variant_id)
            .bind(product_id)
            .bind(qty)
            .execute(&mut **tx)
            .await?
        }
        None => {
            sqlx::query("UPDATE products SET stock = stock + $2 WHERE id = $1")
                .bind(product_id)
                .bind(qty)
                .execute(&mut **tx)
                .await?
        }
    };
    Ok(())
}

async fn remaining_stock(
    tx: &mut Transaction<'_, Postgres>,
    product_id: Uuid,
    variant_id: Option<Uuid>,
) -> CommerceResult<i64> {
    let row = match variant_id {
        Some(variant_id) => {
            sqlx::query("SELECT stock FROM product_variants WHERE id = $1 AND product_id = $2")
                .bind(variant_id)
                .bind(product_id)
                .fetch_optional(&mut **tx)
                .await?
        }
        None => {
            sqlx::query("SELECT stock FROM products WHERE id = $1")
                .bind(product_id)
                .fetch_optional(&mut **tx)
                .await?
        }
    };

    match row {
        Some(row) => Ok(row.try_get("stock")?),
        None => Ok(0),
    }
}
