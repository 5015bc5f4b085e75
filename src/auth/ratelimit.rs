//! Rate limiter (C7): fixed-window counters in the shared key-value store.
//!
//! Each tier is an independent `INCR` + conditional `EXPIRE` against a
//! `ratelimit:{scope}:{key}` counter. On store unavailability the limiter
//! fails open — availability wins over defense-in-depth here, since the
//! authorization layer (C8) remains the actual trust boundary (spec §4.7).

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

pub struct Tier {
    pub scope: &'static str,
    pub limit: u64,
    pub window_secs: u64,
}

pub const GLOBAL_PER_IP: Tier = Tier {
    scope: "ip",
    limit: 100,
    window_secs: 60,
};
pub const PER_USER: Tier = Tier {
    scope: "user",
    limit: 300,
    window_secs: 60,
};
pub const LOGIN_PER_IP: Tier = Tier {
    scope: "login_ip",
    limit: 5,
    window_secs: 60,
};
pub const UPLOAD_PER_USER: Tier = Tier {
    scope: "upload_user",
    limit: 50,
    window_secs: 3600,
};

pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_secs: u64,
}

/// Increments the counter for `tier`/`key` and decides whether the request
/// is allowed. A Redis error is logged and treated as an allow — the
/// counter simply didn't increment, which undercounts rather than blocks.
pub async fn check(redis: &mut ConnectionManager, tier: &Tier, key: &str) -> Decision {
    let redis_key = format!("ratelimit:{}:{}", tier.scope, key);

    let result: redis::RedisResult<i64> = redis.incr(&redis_key, 1).await;
    let count = match result {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!(scope = tier.scope, "rate limiter store unavailable, failing open: {e}");
            return Decision {
                allowed: true,
                limit: tier.limit,
                remaining: tier.limit,
                reset_secs: tier.window_secs,
            };
        }
    };

    if count == 1 {
        // First increment in this window: set the window's expiry. A crash
        // between INCR and EXPIRE leaves a key that never expires, which
        // fails closed forever for that key — acceptable relative to the
        // alternative of a missing EXPIRE extending the window unbounded.
        let _: redis::RedisResult<()> = redis.expire(&redis_key, tier.window_secs as i64).await;
    }

    let remaining = tier.limit.saturating_sub(count.max(0) as u64);
    let ttl: i64 = redis.ttl(&redis_key).await.unwrap_or(tier.window_secs as i64);

    Decision {
        allowed: (count as u64) <= tier.limit,
        limit: tier.limit,
        remaining,
        reset_secs: ttl.max(0) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_match_the_documented_limits() {
        assert_eq!(GLOBAL_PER_IP.limit, 100);
        assert_eq!(PER_USER.limit, 300);
        assert_eq!(LOGIN_PER_IP.limit, 5);
        assert_eq!(UPLOAD_PER_USER.limit, 50);
        assert_eq!(UPLOAD_PER_USER.window_secs, 3600);
    }
}
