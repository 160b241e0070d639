//! Redis-backed shared tier.

use std::time::Duration;

use bytes::Bytes;
use config::SharedTierConfig;
use redis::aio::ConnectionManager;

use super::TierError;

/// Default response timeout when the configuration does not set one.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared tier backed by Redis.
///
/// Values live under prefixed keys with a TTL matching the entry's absolute
/// expiration. Tags are sets of member keys under `{prefix}tag:{tag}`; a
/// tag set's TTL only ever grows, so it outlives every member.
pub struct RedisTier {
    manager: ConnectionManager,
    key_prefix: String,
    response_timeout: Duration,
}

impl RedisTier {
    /// Connect to the configured Redis instance, verifying the connection
    /// with a ping so misconfiguration fails startup.
    pub async fn connect(config: &SharedTierConfig) -> Result<Self, TierError> {
        let client =
            redis::Client::open(config.url.as_str()).map_err(|e| TierError::Connection(e.to_string()))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| TierError::Connection(e.to_string()))?;

        let tier = Self {
            manager,
            key_prefix: config.key_prefix.clone(),
            response_timeout: config.response_timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT),
        };

        let mut conn = tier.manager.clone();
        let _: String = tier
            .run(redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|e| TierError::Connection(e.to_string()))?;

        Ok(tier)
    }

    fn value_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{tag}", self.key_prefix)
    }

    async fn run<T>(&self, query: impl Future<Output = redis::RedisResult<T>>) -> Result<T, TierError> {
        match tokio::time::timeout(self.response_timeout, query).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TierError::Query(e.to_string())),
            Err(_) => Err(TierError::Timeout(self.response_timeout)),
        }
    }

    pub(crate) async fn get(&self, key: &str) -> Result<Option<Bytes>, TierError> {
        let mut conn = self.manager.clone();

        let payload: Option<Vec<u8>> = self
            .run(redis::cmd("GET").arg(self.value_key(key)).query_async(&mut conn))
            .await?;

        Ok(payload.map(Bytes::from))
    }

    pub(crate) async fn set(&self, key: &str, payload: Bytes, ttl: Duration, tags: &[String]) -> Result<(), TierError> {
        let mut conn = self.manager.clone();
        let ttl_secs = ttl.as_secs().max(1);

        let mut pipe = redis::pipe();
        pipe.cmd("SET")
            .arg(self.value_key(key))
            .arg(payload.as_ref())
            .arg("EX")
            .arg(ttl_secs)
            .ignore();

        for tag in tags {
            let tag_key = self.tag_key(tag);
            pipe.cmd("SADD").arg(&tag_key).arg(key).ignore();
            // GT keeps the longest remaining member TTL.
            pipe.cmd("EXPIRE").arg(&tag_key).arg(ttl_secs).arg("GT").ignore();
        }

        self.run(pipe.query_async::<()>(&mut conn)).await
    }

    pub(crate) async fn remove(&self, keys: &[String]) -> Result<(), TierError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("DEL");

        for key in keys {
            cmd.arg(self.value_key(key));
        }

        let _: usize = self.run(cmd.query_async(&mut conn)).await?;

        Ok(())
    }

    pub(crate) async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>, TierError> {
        let mut conn = self.manager.clone();
        let tag_key = self.tag_key(tag);

        let members: Vec<String> = self
            .run(redis::cmd("SMEMBERS").arg(&tag_key).query_async(&mut conn))
            .await?;

        let mut cmd = redis::cmd("DEL");
        cmd.arg(&tag_key);

        for member in &members {
            cmd.arg(self.value_key(member));
        }

        let _: usize = self.run(cmd.query_async(&mut conn)).await?;

        Ok(members)
    }
}
