use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script};

/// Fast-store operations the order-commit core relies on: expiring counters,
/// idempotency markers, and lock keys. Every method maps to a single atomic
/// operation on the backing store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set `key` only if absent, with a ttl. Returns true when this call set it.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete `key` only if it still holds `expected`. Returns true when the
    /// key was deleted by this call.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

// GET followed by DEL is not atomic; the compare happens server-side.
const DELETE_IF_EQ: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisKv {
    client: Client,
}

impl RedisKv {
    pub fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = connection.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let _: () = connection
            .set_ex(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = connection.del(key).await?;
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let deleted: i64 = Script::new(DELETE_IF_EQ)
            .key(key)
            .arg(expected)
            .invoke_async(&mut connection)
            .await?;
        Ok(deleted == 1)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let value: i64 = connection.incr(key, delta).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let _: bool = connection.expire(key, ttl.as_secs().max(1) as i64).await?;
        Ok(())
    }
}
