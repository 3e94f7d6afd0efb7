pub mod config;
pub mod contracts;
pub mod db;
pub mod kv;
pub mod memory;
pub mod redis_bus;

pub use config::ServiceConfig;
pub use contracts::{
    CartLine, CheckoutRequest, CheckoutResponse, CoinBalanceResponse, ConfirmPaymentRequest,
    ConfirmPaymentResponse, OrderConfirmedEvent, OrderItemView, OrderView, WebhookAck,
};
pub use db::connect_database;
pub use kv::{KvStore, RedisKv};
pub use memory::MemoryKv;
pub use redis_bus::RedisBus;
