//! Redis-backed counter store.
//!
//! Each operation is a single round trip. The sliding window and the
//! increment run as Lua scripts so the server executes every step of the
//! operation without interleaving other clients.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use super::CounterStore;
use crate::error::Result;

/// Default prefix for every key written by the store.
pub const DEFAULT_KEY_PREFIX: &str = "floodgate";

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local interval_ms = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local member = ARGV[4]

redis.call("ZREMRANGEBYSCORE", key, "-inf", "(" .. (now_ms - interval_ms))

local count = redis.call("ZCARD", key)
if count >= rate then
    return 1
end

redis.call("ZADD", key, now_ms, member)
redis.call("PEXPIRE", key, interval_ms)
return 0
"#;

const INCR_SCRIPT: &str = r#"
local value = redis.call("INCR", KEYS[1])
local ttl_ms = tonumber(ARGV[1])
if ttl_ms > 0 then
    redis.call("PEXPIRE", KEYS[1], ttl_ms)
end
return value
"#;

/// Options for [`RedisStore`].
#[derive(Clone)]
pub struct RedisStoreOptions {
    /// Connection used for every command
    pub connection_manager: ConnectionManager,
    /// Prefix prepended to every key, separated by a colon
    pub key_prefix: Option<String>,
    /// Expiration refreshed on every increment of an active counter
    pub counter_ttl: Option<Duration>,
}

/// Counter store shared through a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    key_prefix: String,
    counter_ttl: Option<Duration>,
    sliding_window_script: Script,
    incr_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("counter_ttl", &self.counter_ttl)
            .finish()
    }
}

impl RedisStore {
    /// Create a store from explicit options.
    pub fn new(options: RedisStoreOptions) -> Self {
        Self {
            connection_manager: options.connection_manager,
            key_prefix: options
                .key_prefix
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            counter_ttl: options.counter_ttl,
            sliding_window_script: Script::new(SLIDING_WINDOW_SCRIPT),
            incr_script: Script::new(INCR_SCRIPT),
        }
    }

    /// Open a connection to `url` and create a store with default options.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, None, None).await
    }

    /// Open a connection to `url` with an explicit key prefix and counter TTL.
    pub async fn connect_with(
        url: &str,
        key_prefix: Option<String>,
        counter_ttl: Option<Duration>,
    ) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection_manager = client.get_connection_manager().await?;

        info!(key_prefix = ?key_prefix, "Connected to Redis counter store");

        Ok(Self::new(RedisStoreOptions {
            connection_manager,
            key_prefix,
            counter_ttl,
        }))
    }

    /// Full Redis key for a limiting key.
    pub fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn sliding_window(
        &self,
        key: &str,
        interval: Duration,
        rate: u64,
        now_ms: u64,
    ) -> Result<bool> {
        let mut connection_manager = self.connection_manager.clone();
        // Members must be unique so events on the same millisecond are distinct
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let limited: i64 = self
            .sliding_window_script
            .key(self.redis_key(key))
            .arg(interval.as_millis() as u64)
            .arg(rate)
            .arg(now_ms)
            .arg(member)
            .invoke_async(&mut connection_manager)
            .await?;

        Ok(limited == 1)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut connection_manager = self.connection_manager.clone();
        let ttl_ms = self
            .counter_ttl
            .map(|ttl| ttl.as_millis() as u64)
            .unwrap_or(0);

        let value: i64 = self
            .incr_script
            .key(self.redis_key(key))
            .arg(ttl_ms)
            .invoke_async(&mut connection_manager)
            .await?;

        Ok(value)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut connection_manager = self.connection_manager.clone();

        let value: i64 = redis::cmd("DECR")
            .arg(self.redis_key(key))
            .query_async(&mut connection_manager)
            .await?;

        if value < 0 {
            debug!(key = %key, value = value, "Redis counter below zero after decrement");
        }

        Ok(value)
    }
}
