use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order-create boundary of the external payment provider. Constructed and
/// injected at startup so tests and local runs can substitute a fake.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, amount: i64, currency: &str, receipt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct CreateOrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateOrderReply {
    id: String,
}

pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpGateway {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_order(&self, amount: i64, currency: &str, receipt: &str) -> Result<String> {
        let reply: CreateOrderReply = self
            .http
            .post(format!("{}/v1/orders", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&CreateOrderBody {
                amount,
                currency,
                receipt,
            })
            .send()
            .await
            .context("payment gateway unreachable")?
            .error_for_status()
            .context("payment gateway rejected order create")?
            .json()
            .await
            .context("payment gateway returned malformed order")?;

        Ok(reply.id)
    }
}

/// Offline stand-in that mints provider refs locally.
#[derive(Default)]
pub struct StaticGateway;

#[async_trait]
impl PaymentGateway for StaticGateway {
    async fn create_order(&self, _amount: i64, _currency: &str, _receipt: &str) -> Result<String> {
        Ok(format!("ord_{}", Uuid::new_v4().simple()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_gateway_mints_distinct_provider_refs() {
        let gateway = StaticGateway;
        let first = gateway.create_order(129_900, "INR", "receipt-1").await.unwrap();
        let second = gateway.create_order(129_900, "INR", "receipt-1").await.unwrap();
        assert!(first.starts_with("ord_"));
        assert_ne!(first, second);
    }
}
