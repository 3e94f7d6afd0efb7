use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub lines: Vec<CartLine>,
    #[serde(default)]
    pub coins_to_redeem: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub checkout_group_id: Uuid,
    pub order_ids: Vec<Uuid>,
    pub provider_order_ref: String,
    pub amount_payable: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub provider_order_ref: String,
    pub provider_payment_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmPaymentResponse {
    pub order_ids: Vec<Uuid>,
    pub already_processed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub vendor_name: String,
    pub status: String,
    pub amount_payable: i64,
    pub coins_used: i64,
    pub items: Vec<OrderItemView>,
    pub subtotal: i64,
    pub tax: i64,
    pub shipping: i64,
    pub discount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemView {
    pub product_id: Uuid,
    pub product_name: String,
    pub variant_id: Option<Uuid>,
    pub quantity: i64,
    pub unit_price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinBalanceResponse {
    pub user_id: Uuid,
    pub cached_balance: i64,
    pub recomputed_balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub event: String,
    pub handled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmedEvent {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub vendor_id: Uuid,
    pub amount_payable: i64,
    pub confirmed_at: DateTime<Utc>,
}
