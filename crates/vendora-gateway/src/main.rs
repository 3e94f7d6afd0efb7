use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{error, info};
use uuid::Uuid;
use vendora_coins::CoinLedger;
use vendora_core::{
    CommerceError, CommerceResult, ErrorKind, OrderStatus, PaymentStatus, SettlementStatus,
    UserRole, validate_transition,
};
use vendora_inventory::{ReservationLedger, restore};
use vendora_payments::{
    ConfirmationProtocol, HttpGateway, PaymentGateway, WebhookEvent, parse_webhook,
};
use vendora_platform::{
    CartLine, CheckoutRequest, CheckoutResponse, CoinBalanceResponse, ConfirmPaymentRequest,
    ConfirmPaymentResponse, KvStore, OrderItemView, OrderView, RedisBus, RedisKv, ServiceConfig,
    WebhookAck, connect_database,
};

const CURRENCY: &str = "INR";
const TAX_RATE_BPS: i64 = 500;
const SHIPPING_FLAT: i64 = 4900;
const COMMISSION_RATE_BPS: i64 = 1000;
const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    kv: Arc<RedisKv>,
    coins: CoinLedger,
    reservations: Arc<ReservationLedger<RedisKv>>,
    protocol: Arc<ConfirmationProtocol<RedisKv>>,
    gateway: Arc<dyn PaymentGateway>,
    webhook_secret: String,
    payment_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UpdateStatusRequest {
    to_status: String,
    actor: String,
    role: String,
    #[serde(default)]
    allow_admin_override: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UpdateStatusResponse {
    order_id: Uuid,
    from_status: String,
    to_status: String,
    stock_restored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SetValuationRequest {
    minor_units_per_coin: i64,
    effective_from: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vendora_gateway=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let pool = connect_database(&config.database_url, config.db_pool_size).await?;
    let kv = Arc::new(RedisKv::connect(&config.redis_url)?);
    let bus = RedisBus::connect(&config.redis_url)?;
    let coins = CoinLedger::new(pool.clone());
    let reservations = Arc::new(ReservationLedger::new(
        pool.clone(),
        kv.clone(),
        Duration::from_secs(config.reservation_ttl_secs),
    ));
    let protocol = Arc::new(ConfirmationProtocol::new(
        pool.clone(),
        kv.clone(),
        coins.clone(),
        Some(bus),
        config.payment_webhook_secret.clone(),
    ));
    let gateway: Arc<dyn PaymentGateway> = Arc::new(HttpGateway::new(
        config.payment_gateway_url.clone(),
        config.payment_gateway_key.clone(),
    ));

    let state = AppState {
        pool,
        kv,
        coins,
        reservations,
        protocol,
        gateway,
        webhook_secret: config.payment_webhook_secret.clone(),
        payment_timeout: Duration::from_secs(config.payment_timeout_secs),
    };

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/checkout", post(checkout))
        .route("/payments/confirm", post(confirm_payment))
        .route("/webhooks/payment", post(payment_webhook))
        .route("/orders/{order_id}", get(get_order))
        .route("/orders/{order_id}/status", post(update_order_status))
        .route("/users/{user_id}/coins", get(get_coin_balance))
        .route("/admin/coin-valuations", post(set_coin_valuation))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

fn error_response(err: CommerceError) -> (StatusCode, String) {
    let status = match err.kind() {
        ErrorKind::Security => StatusCode::UNAUTHORIZED,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {err:#}");
        return (status, "internal error".to_string());
    }
    (status, err.to_string())
}

struct PricedLine {
    product_id: Uuid,
    variant_id: Option<Uuid>,
    quantity: i64,
    unit_price: i64,
    vendor_id: Uuid,
}

async fn checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, (StatusCode, String)> {
    if payload.lines.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "cart is empty".to_string()));
    }
    for line in &payload.lines {
        if line.quantity <= 0 {
            return Err((
                StatusCode::BAD_REQUEST,
                "line quantity must be positive".to_string(),
            ));
        }
    }
    if payload.coins_to_redeem < 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "coins_to_redeem cannot be negative".to_string(),
        ));
    }

    let priced = price_lines(&state.pool, &payload.lines)
        .await
        .map_err(error_response)?;

    if payload.coins_to_redeem > 0 {
        let balance = state
            .coins
            .cached_balance(payload.user_id)
            .await
            .map_err(error_response)?;
        if balance < payload.coins_to_redeem {
            return Err(error_response(CommerceError::InsufficientBalance {
                user_id: payload.user_id,
                requested: payload.coins_to_redeem,
                available: balance,
            }));
        }
    }

    // Soft holds first; everything durable happens after the gateway call.
    let mut reserved: Vec<&CartLine> = Vec::new();
    for line in &payload.lines {
        if let Err(err) = state
            .reservations
            .reserve(line.product_id, line.quantity, line.variant_id)
            .await
        {
            release_lines(&state, &reserved).await;
            return Err(error_response(err));
        }
        reserved.push(line);
    }

    match create_checkout(&state, &payload, priced).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => {
            release_lines(&state, &reserved).await;
            Err(error_response(err))
        }
    }
}

async fn release_lines(state: &AppState, lines: &[&CartLine]) {
    for line in lines {
        if let Err(err) = state
            .reservations
            .release(line.product_id, line.quantity, line.variant_id)
            .await
        {
            error!(product_id = %line.product_id, "reservation rollback failed: {err:#}");
        }
    }
}

async fn price_lines(pool: &PgPool, lines: &[CartLine]) -> CommerceResult<Vec<PricedLine>> {
    let mut priced = Vec::with_capacity(lines.len());
    for line in lines {
        let row = match line.variant_id {
            Some(variant_id) => {
                sqlx::query(
                    r#"
                    SELECT p.vendor_id, v.price
                    FROM product_variants v
                    JOIN products p ON p.id = v.product_id
                    WHERE v.id = $1 AND v.product_id = $2
                    "#,
                )
                .bind(variant_id)
                .bind(line.product_id)
                .fetch_optional(pool)
                .await?
            }
            None => {
                sqlx::query("SELECT vendor_id, price FROM products WHERE id = $1")
                    .bind(line.product_id)
                    .fetch_optional(pool)
                    .await?
            }
        };

        let Some(row) = row else {
            return Err(CommerceError::NotFound(format!(
                "product {}",
                line.product_id
            )));
        };
        priced.push(PricedLine {
            product_id: line.product_id,
            variant_id: line.variant_id,
            quantity: line.quantity,
            unit_price: row.try_get("price")?,
            vendor_id: row.try_get("vendor_id")?,
        });
    }
    Ok(priced)
}

async fn create_checkout(
    state: &AppState,
    payload: &CheckoutRequest,
    priced: Vec<PricedLine>,
) -> CommerceResult<CheckoutResponse> {
    // One order per vendor, all sharing one payment.
    let mut vendor_groups: Vec<(Uuid, Vec<PricedLine>)> = Vec::new();
    for line in priced {
        match vendor_groups
            .iter_mut()
            .find(|(vendor_id, _)| *vendor_id == line.vendor_id)
        {
            Some((_, lines)) => lines.push(line),
            None => vendor_groups.push((line.vendor_id, vec![line])),
        }
    }

    let valuation = state.coins.current_valuation().await?;
    let mut remaining_coins = payload.coins_to_redeem;
    let mut group_total = 0i64;
    let mut planned = Vec::with_capacity(vendor_groups.len());

    for (vendor_id, lines) in vendor_groups {
        let subtotal: i64 = lines
            .iter()
            .map(|line| line.unit_price * line.quantity)
            .sum();
        let tax = subtotal * TAX_RATE_BPS / 10_000;
        let coins_here = remaining_coins.min(subtotal / valuation);
        remaining_coins -= coins_here;
        let discount = coins_here * valuation;
        let commission = subtotal * COMMISSION_RATE_BPS / 10_000;
        let amount_payable = subtotal + tax + SHIPPING_FLAT - discount;

        group_total += amount_payable;
        planned.push(PlannedOrder {
            vendor_id,
            lines,
            subtotal,
            tax,
            discount,
            coins_used: coins_here,
            commission,
            amount_payable,
        });
    }

    if remaining_coins > 0 {
        return Err(CommerceError::Validation(
            "coins to redeem exceed order value".into(),
        ));
    }

    let checkout_group_id = Uuid::new_v4();
    let provider_order_ref = state
        .gateway
        .create_order(group_total, CURRENCY, &checkout_group_id.to_string())
        .await
        .map_err(CommerceError::Internal)?;

    let now = Utc::now();
    let mut tx = state.pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO payments (id, provider_order_ref, amount, currency, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&provider_order_ref)
    .bind(group_total)
    .bind(CURRENCY)
    .bind(PaymentStatus::Pending.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let mut order_ids = Vec::with_capacity(planned.len());
    for order in &planned {
        let order_id = Uuid::new_v4();
        order_ids.push(order_id);

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, user_id, vendor_id, status, amount_payable, coins_used,
                coins_debited, stock_deducted, provider_order_ref, checkout_group_id,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, FALSE, $7, $8, $9, $9)
            "#,
        )
        .bind(order_id)
        .bind(payload.user_id)
        .bind(order.vendor_id)
        .bind(OrderStatus::Created.as_str())
        .bind(order.amount_payable)
        .bind(order.coins_used)
        .bind(&provider_order_ref)
        .bind(checkout_group_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for line in &order.lines {
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, product_id, variant_id, quantity, unit_price)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(line.product_id)
            .bind(line.variant_id)
            .bind(line.quantity)
            .bind(line.unit_price)
            .execute(&mut *tx)
            .await?;
        }

        let vendor_earnings = order.subtotal - order.commission;
        sqlx::query(
            r#"
            INSERT INTO order_financials (
                order_id, subtotal, tax, shipping, discount,
                commission_rate_bps, commission_amount, vendor_earnings, platform_earnings,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(order_id)
        .bind(order.subtotal)
        .bind(order.tax)
        .bind(SHIPPING_FLAT)
        .bind(order.discount)
        .bind(COMMISSION_RATE_BPS)
        .bind(order.commission)
        .bind(vendor_earnings)
        .bind(order.commission)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO order_settlements (id, order_id, vendor_id, status, amount, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order_id)
        .bind(order.vendor_id)
        .bind(SettlementStatus::Pending.as_str())
        .bind(vendor_earnings)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        transition_in_tx(&mut tx, order_id, OrderStatus::Created, OrderStatus::Pending).await?;
        transition_in_tx(
            &mut tx,
            order_id,
            OrderStatus::Pending,
            OrderStatus::PendingPayment,
        )
        .await?;
    }

    tx.commit().await?;

    for order_id in &order_ids {
        if let Err(err) = state
            .kv
            .set(
                &format!("payment_timeout:{order_id}"),
                "1",
                state.payment_timeout,
            )
            .await
        {
            error!(%order_id, "payment timeout marker failed: {err:#}");
        }
    }

    info!(
        %checkout_group_id,
        orders = order_ids.len(),
        amount = group_total,
        "checkout created"
    );

    Ok(CheckoutResponse {
        checkout_group_id,
        order_ids,
        provider_order_ref,
        amount_payable: group_total,
        currency: CURRENCY.to_string(),
    })
}

struct PlannedOrder {
    vendor_id: Uuid,
    lines: Vec<PricedLine>,
    subtotal: i64,
    tax: i64,
    discount: i64,
    coins_used: i64,
    commission: i64,
    amount_payable: i64,
}

async fn transition_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
    from: OrderStatus,
    to: OrderStatus,
) -> CommerceResult<()> {
    validate_transition(from, to, "checkout", UserRole::Customer, false)?;

    let updated = sqlx::query("UPDATE orders SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2")
        .bind(order_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

    if updated.rows_affected() == 0 {
        return Err(CommerceError::AlreadyProcessing(format!(
            "order {order_id} changed concurrently"
        )));
    }
    Ok(())
}

async fn confirm_payment(
    State(state): State<AppState>,
    Json(payload): Json<ConfirmPaymentRequest>,
) -> Result<Json<ConfirmPaymentResponse>, (StatusCode, String)> {
    let outcome = state
        .protocol
        .confirm(
            &payload.provider_order_ref,
            &payload.provider_payment_id,
            &payload.signature,
        )
        .await
        .map_err(error_response)?;

    Ok(Json(ConfirmPaymentResponse {
        order_ids: outcome.order_ids,
        already_processed: outcome.already_processed,
    }))
}

async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, (StatusCode, String)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or((StatusCode::UNAUTHORIZED, "missing signature".to_string()))?;

    let event =
        parse_webhook(&state.webhook_secret, &body, signature).map_err(error_response)?;

    match event {
        WebhookEvent::Captured {
            provider_order_ref,
            payment_id,
        } => {
            state
                .protocol
                .confirm_verified(&provider_order_ref, &payment_id)
                .await
                .map_err(error_response)?;
            Ok(Json(WebhookAck {
                event: "payment.captured".to_string(),
                handled: true,
            }))
        }
        WebhookEvent::Failed {
            provider_order_ref,
            payment_id,
        } => {
            state
                .protocol
                .mark_failed(&provider_order_ref, &payment_id)
                .await
                .map_err(error_response)?;
            Ok(Json(WebhookAck {
                event: "payment.failed".to_string(),
                handled: true,
            }))
        }
    }
}

async fn update_order_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<UpdateStatusResponse>, (StatusCode, String)> {
    change_status(&state.pool, order_id, &payload)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn change_status(
    pool: &PgPool,
    order_id: Uuid,
    payload: &UpdateStatusRequest,
) -> CommerceResult<UpdateStatusResponse> {
    let to = OrderStatus::parse(&payload.to_status)?;
    let role = UserRole::parse(&payload.role);

    let row = sqlx::query("SELECT status, stock_deducted FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(CommerceError::NotFound(format!("order {order_id}")));
    };
    let from = OrderStatus::parse(&row.try_get::<String, _>("status")?)?;
    let stock_deducted: bool = row.try_get("stock_deducted")?;

    validate_transition(from, to, &payload.actor, role, payload.allow_admin_override)?;

    let stock_restored = if from == to {
        false
    } else {
        apply_status_change(pool, order_id, from, to, stock_deducted).await?
    };

    Ok(UpdateStatusResponse {
        order_id,
        from_status: from.as_str().to_string(),
        to_status: to.as_str().to_string(),
        stock_restored,
    })
}

/// The status CAS and any compensating stock restore commit together.
async fn apply_status_change(
    pool: &PgPool,
    order_id: Uuid,
    from: OrderStatus,
    to: OrderStatus,
    stock_deducted: bool,
) -> CommerceResult<bool> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let updated = match to {
        OrderStatus::Delivered => {
            sqlx::query(
                "UPDATE orders SET status = $3, delivered_at = $4, updated_at = $4 WHERE id = $1 AND status = $2",
            )
            .bind(order_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?
        }
        _ => {
            sqlx::query(
                "UPDATE orders SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2",
            )
            .bind(order_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?
        }
    };

    if updated.rows_affected() == 0 {
        return Err(CommerceError::AlreadyProcessing(format!(
            "order {order_id} changed concurrently"
        )));
    }

    let mut stock_restored = false;
    if to == OrderStatus::Cancelled && stock_deducted {
        let items = sqlx::query(
            "SELECT product_id, variant_id, quantity FROM order_items WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_all(&mut *tx)
        .await?;

        for item in items {
            let product_id: Uuid = item.try_get("product_id")?;
            let variant_id: Option<Uuid> = item.try_get("variant_id")?;
            let quantity: i64 = item.try_get("quantity")?;
            restore(&mut tx, product_id, quantity, variant_id).await?;
        }

        sqlx::query("UPDATE orders SET stock_deducted = FALSE WHERE id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await?;
        stock_restored = true;
    }

    tx.commit().await?;
    Ok(stock_restored)
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderView>, (StatusCode, String)> {
    build_order_view(&state.pool, order_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Read-side projection with explicit typed lookups; nothing here feeds back
/// into the commit path.
async fn build_order_view(pool: &PgPool, order_id: Uuid) -> CommerceResult<OrderView> {
    let order = sqlx::query(
        r#"
        SELECT o.user_id, o.vendor_id, o.status, o.amount_payable, o.coins_used, o.created_at,
               f.subtotal, f.tax, f.shipping, f.discount
        FROM orders o
        JOIN order_financials f ON f.order_id = o.id
        WHERE o.id = $1
        "#,
    )
    .bind(order_id)
    .fetch_optional(pool)
    .await?;

    let Some(order) = order else {
        return Err(CommerceError::NotFound(format!("order {order_id}")));
    };

    let vendor_id: Uuid = order.try_get("vendor_id")?;
    let vendor_name: String = sqlx::query("SELECT name FROM vendors WHERE id = $1")
        .bind(vendor_id)
        .fetch_optional(pool)
        .await?
        .map(|row| row.try_get("name"))
        .transpose()?
        .unwrap_or_default();

    let item_rows = sqlx::query(
        r#"
        SELECT i.product_id, i.variant_id, i.quantity, i.unit_price, p.name
        FROM order_items i
        JOIN products p ON p.id = i.product_id
        WHERE i.order_id = $1
        "#,
    )
    .bind(order_id)
    .fetch_all(pool)
    .await?;

    let mut items = Vec::with_capacity(item_rows.len());
    for row in item_rows {
        items.push(OrderItemView {
            product_id: row.try_get("product_id")?,
            product_name: row.try_get("name")?,
            variant_id: row.try_get("variant_id")?,
            quantity: row.try_get("quantity")?,
            unit_price: row.try_get("unit_price")?,
        });
    }

    Ok(OrderView {
        order_id,
        user_id: order.try_get("user_id")?,
        vendor_name,
        status: order.try_get("status")?,
        amount_payable: order.try_get("amount_payable")?,
        coins_used: order.try_get("coins_used")?,
        items,
        subtotal: order.try_get("subtotal")?,
        tax: order.try_get("tax")?,
        shipping: order.try_get("shipping")?,
        discount: order.try_get("discount")?,
        created_at: order.try_get("created_at")?,
    })
}

async fn get_coin_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<CoinBalanceResponse>, (StatusCode, String)> {
    let cached = state
        .coins
        .cached_balance(user_id)
        .await
        .map_err(error_response)?;
    let recomputed = state
        .coins
        .recalculate_balance(user_id)
        .await
        .map_err(error_response)?;

    Ok(Json(CoinBalanceResponse {
        user_id,
        cached_balance: cached,
        recomputed_balance: recomputed,
    }))
}

async fn set_coin_valuation(
    State(state): State<AppState>,
    Json(payload): Json<SetValuationRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .coins
        .set_valuation(payload.minor_units_per_coin, payload.effective_from)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::CREATED)
}
