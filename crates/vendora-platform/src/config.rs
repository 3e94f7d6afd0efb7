use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub http_addr: String,
    pub payment_webhook_secret: String,
    pub payment_gateway_url: String,
    pub payment_gateway_key: String,
    pub settlement_hold_days: i64,
    pub reservation_ttl_secs: u64,
    pub payment_timeout_secs: u64,
    pub db_pool_size: u32,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok(), default_http_addr)
    }

    pub fn worker_from_env() -> Result<Self> {
        let mut config = Self::from_env("")?;
        config.http_addr = String::new();
        Ok(config)
    }

    fn from_vars(get: impl Fn(&str) -> Option<String>, default_http_addr: &str) -> Result<Self> {
        let database_url = get("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = get("REDIS_URL").context("REDIS_URL is required")?;
        let http_addr = get("HTTP_ADDR").unwrap_or_else(|| default_http_addr.to_string());
        let payment_webhook_secret =
            get("PAYMENT_WEBHOOK_SECRET").context("PAYMENT_WEBHOOK_SECRET is required")?;
        let payment_gateway_url = get("PAYMENT_GATEWAY_URL")
            .unwrap_or_else(|| "https://api.payments.example".to_string());
        let payment_gateway_key = get("PAYMENT_GATEWAY_KEY").unwrap_or_default();

        Ok(Self {
            database_url,
            redis_url,
            http_addr,
            payment_webhook_secret,
            payment_gateway_url,
            payment_gateway_key,
            settlement_hold_days: int_or(get("SETTLEMENT_HOLD_DAYS"), 7),
            reservation_ttl_secs: int_or(get("RESERVATION_TTL_SECS"), 900) as u64,
            payment_timeout_secs: int_or(get("PAYMENT_TIMEOUT_SECS"), 1800) as u64,
            db_pool_size: int_or(get("DB_POOL_SIZE"), 10) as u32,
        })
    }
}

fn int_or(raw: Option<String>, default: i64) -> i64 {
    raw.and_then(|value| value.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("DATABASE_URL", "postgres://localhost/vendora"),
        ("REDIS_URL", "redis://localhost"),
        ("PAYMENT_WEBHOOK_SECRET", "secret"),
    ];

    #[test]
    fn missing_database_url_is_an_error() {
        let err = ServiceConfig::from_vars(|_| None, "0.0.0.0:8080").unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn defaults_fill_the_optional_settings() {
        let config = ServiceConfig::from_vars(vars(REQUIRED), "0.0.0.0:8080").unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:8080");
        assert_eq!(config.settlement_hold_days, 7);
        assert_eq!(config.reservation_ttl_secs, 900);
        assert_eq!(config.db_pool_size, 10);
    }

    #[test]
    fn abandoned_orders_outlive_the_payment_window() {
        // The sweep cancels pre-payment orders by this same setting, so an
        // order is never swept while its payment is still in flight.
        let config = ServiceConfig::from_vars(vars(REQUIRED), "0.0.0.0:8080").unwrap();
        assert_eq!(config.payment_timeout_secs, 1800);
        assert!(config.payment_timeout_secs >= config.reservation_ttl_secs);
    }

    #[test]
    fn unparseable_numbers_fall_back_to_defaults() {
        assert_eq!(int_or(Some("abc".to_string()), 7), 7);
        assert_eq!(int_or(Some("21".to_string()), 7), 21);
        assert_eq!(int_or(None, 7), 7);
    }
}
