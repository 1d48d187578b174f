//! Process configuration.
//!
//! One flat struct, loaded once at process start and passed by value into
//! constructors, with no process-wide settings singleton, and an explicit
//! field list and explicit parse-with-default per field.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_port: u16,
    pub metrics_port: u16,
    pub metrics_host: String,

    pub storage_url: String,
    pub kv_url: String,
    pub broker_addrs: String,
    pub topic_prefix: String,

    pub outbox_batch_size: i64,
    pub outbox_poll_interval: Duration,
    pub outbox_max_retries: i32,
    pub outbox_base_delay: Duration,
    pub outbox_max_delay: Duration,
    pub outbox_max_consecutive_failures: u32,

    pub rate_limit_per_window: u32,
    pub rate_limit_window: Duration,

    pub idempotency_ttl: Duration,
    pub shutdown_grace: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.parse().map_err(|e| format!("{key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default_secs: u64) -> Result<Duration, String> {
    env_parse(key, default_secs).map(Duration::from_secs)
}

fn env_millis(key: &str, default_ms: u64) -> Result<Duration, String> {
    env_parse(key, default_ms).map(Duration::from_millis)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        Ok(Self {
            rpc_port: env_parse("RPC_PORT", 8080)?,
            metrics_port: env_parse("METRICS_PORT", 9090)?,
            metrics_host: env::var("METRICS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),

            storage_url: env::var("STORAGE_URL")
                .or_else(|_| env::var("DATABASE_URL"))
                .map_err(|_| "STORAGE_URL must be set".to_string())?,
            kv_url: env::var("KV_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            broker_addrs: env::var("BROKER_ADDRS")
                .unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string()),
            topic_prefix: env::var("TOPIC_PREFIX").unwrap_or_else(|_| "payments".to_string()),

            outbox_batch_size: env_parse("OUTBOX_BATCH_SIZE", 100)?,
            outbox_poll_interval: env_secs("OUTBOX_POLL_INTERVAL_SECS", 1)?,
            outbox_max_retries: env_parse("OUTBOX_MAX_RETRIES", 5)?,
            outbox_base_delay: env_millis("OUTBOX_BASE_DELAY_MS", 500)?,
            outbox_max_delay: env_secs("OUTBOX_MAX_DELAY_SECS", 30)?,
            outbox_max_consecutive_failures: env_parse("OUTBOX_MAX_CONSECUTIVE_FAILURES", 10)?,

            rate_limit_per_window: env_parse("RATE_LIMIT_PER_WINDOW", 100)?,
            rate_limit_window: env_secs("RATE_LIMIT_WINDOW_SECS", 60)?,

            idempotency_ttl: env_secs("IDEMPOTENCY_TTL_SECS", 24 * 60 * 60)?,
            shutdown_grace: env_secs("SHUTDOWN_GRACE_SECS", 30)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default_when_unset() {
        let val: u16 = env_parse("PAYMENTS_RS_TEST_UNSET_VAR_XYZ", 42).unwrap();
        assert_eq!(val, 42);
    }
}
