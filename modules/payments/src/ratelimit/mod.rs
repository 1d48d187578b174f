//! Sliding-window rate limiter.
//!
//! A per-key admission decision executed as a single Lua script against a
//! shared Redis-compatible store, so trim/count/insert/TTL run as one
//! atomic pipeline rather than a check-then-insert round trip, which would
//! let two concurrent callers both observe room under the limit and both
//! get admitted. See DESIGN.md for where this design is grounded.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use tracing::warn;

const SCRIPT_SRC: &str = include_str!("sliding_window.lua");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Rejected after a real check against the store.
    Rejected,
    /// The store was unreachable; admitted per the fail-open policy.
    /// Distinct from `Admitted` so callers can still log the degraded
    /// path without treating it as a normal admission.
    AdmittedFailOpen,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

pub async fn connect(kv_url: &str) -> Result<ConnectionManager, RedisError> {
    let client = redis::Client::open(kv_url)?;
    client.get_connection_manager().await
}

#[derive(Clone)]
pub struct RateLimiter {
    conn: ConnectionManager,
    script: Script,
}

impl RateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(SCRIPT_SRC),
        }
    }

    /// Checks admission for `key` against `limit` events per `window`.
    /// Keys are opaque strings supplied by the caller (client id, caller
    /// IP, or method name); this module doesn't derive the key itself.
    pub async fn allow(&self, key: &str, limit: u32, window: Duration) -> Admission {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let window_ms = window.as_millis() as i64;
        let nonce: u64 = rand::random();

        let mut conn = self.conn.clone();
        let result: Result<i64, RedisError> = self
            .script
            .key(key)
            .arg(limit)
            .arg(window_ms)
            .arg(now_ms)
            .arg(nonce)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(1) => Admission::Admitted,
            Ok(_) => Admission::Rejected,
            Err(err) => {
                warn!(%key, error = %err, "rate limit store unreachable, failing open");
                Admission::AdmittedFailOpen
            }
        }
    }
}
