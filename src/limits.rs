//! Per-account upload rate limiting over a fixed window.
//!
//! The counter lives in an external KV so replicas share state. If the KV
//! is unreachable the limiter is bypassed; the signature check remains the
//! primary defense.

use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
pub struct Quota {
    /// False once the window cap is spent; the consuming request that hits
    /// the cap exactly is still allowed.
    pub allowed: bool,
    pub remaining: u32,
    /// Unix milliseconds when the current window ends.
    pub reset: u64,
}

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consume one slot for `account` and report what is left.
    async fn check(&self, account: &str) -> Quota;
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct RedisLimiter {
    conn: redis::aio::ConnectionManager,
    duration: u64,
    max: u32,
}

impl RedisLimiter {
    pub async fn connect(url: &str, duration: u64, max: u32) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            duration: duration.max(1),
            max,
        })
    }
}

#[async_trait::async_trait]
impl RateLimiter for RedisLimiter {
    async fn check(&self, account: &str) -> Quota {
        let window = now_ms() / self.duration;
        let reset = (window + 1) * self.duration;
        let key = format!("imagehoster:uploads:{}:{}", account, window);
        let mut conn = self.conn.clone();
        let count: Result<u64, redis::RedisError> = conn.incr(&key, 1u32).await;
        match count {
            Ok(count) => {
                // TTL only cleans up; the window boundary is in the key.
                let _: Result<bool, _> = conn.pexpire(&key, (self.duration * 2) as i64).await;
                let count = count.min(u64::from(u32::MAX)) as u32;
                Quota {
                    allowed: count <= self.max,
                    remaining: self.max.saturating_sub(count),
                    reset,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "rate limit KV unavailable, bypassing");
                Quota {
                    allowed: true,
                    remaining: self.max,
                    reset,
                }
            }
        }
    }
}

/// Single-process fallback used when no KV is configured, and in tests.
pub struct MemoryLimiter {
    windows: Mutex<HashMap<String, (u64, u32)>>,
    duration: u64,
    max: u32,
}

impl MemoryLimiter {
    pub fn new(duration: u64, max: u32) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            duration: duration.max(1),
            max,
        }
    }
}

#[async_trait::async_trait]
impl RateLimiter for MemoryLimiter {
    async fn check(&self, account: &str) -> Quota {
        let window = now_ms() / self.duration;
        let reset = (window + 1) * self.duration;
        let mut windows = self.windows.lock().expect("limiter lock");
        let entry = windows.entry(account.to_string()).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }
        entry.1 += 1;
        Quota {
            allowed: entry.1 <= self.max,
            remaining: self.max.saturating_sub(entry.1),
            reset,
        }
    }
}
