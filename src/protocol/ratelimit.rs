//! Per-source token buckets for handshake processing under load

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Configuration for rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub packets_per_second: u64,
    pub burst: u64,
    pub max_entries: usize,
    /// Buckets idle for longer than this are dropped by `cleanup`
    pub idle_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            packets_per_second: 20,
            burst: 5,
            max_entries: 8192,
            idle_timeout: Duration::from_secs(1),
        }
    }
}

/// Tokens are nanoseconds of credit; one packet costs 1s / packets_per_second.
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

/// Rate limiter for DoS protection.
pub struct RateLimiter {
    config: RateLimitConfig,
    packet_cost: u64,
    max_tokens: u64,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

/// IPv6 sources share a bucket per /64
fn bucket_key(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => IpAddr::V4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => {
                let bits = u128::from(v6) & (!0u128 << 64);
                IpAddr::V6(Ipv6Addr::from(bits))
            }
        },
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let packet_cost = 1_000_000_000 / config.packets_per_second.max(1);
        let max_tokens = packet_cost * config.burst.max(1);
        Self {
            config,
            packet_cost,
            max_tokens,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Spend one packet's worth of tokens for `ip`
    pub fn allow(&self, ip: IpAddr, now: Instant) -> bool {
        let key = bucket_key(ip);
        let mut buckets = self.buckets.lock();

        if let Some(bucket) = buckets.get_mut(&key) {
            let elapsed = now.saturating_duration_since(bucket.last_refill).as_nanos();
            let refill = u64::try_from(elapsed).unwrap_or(u64::MAX);
            bucket.tokens = bucket.tokens.saturating_add(refill).min(self.max_tokens);
            bucket.last_refill = now;
            if bucket.tokens >= self.packet_cost {
                bucket.tokens -= self.packet_cost;
                return true;
            }
            return false;
        }

        if buckets.len() >= self.config.max_entries {
            tracing::debug!("Rate limiter table full, refusing {}", key);
            return false;
        }
        buckets.insert(
            key,
            Bucket {
                tokens: self.max_tokens - self.packet_cost,
                last_refill: now,
            },
        );
        true
    }

    /// Drop idle buckets. Called periodically by the device.
    pub fn cleanup(&self, now: Instant) {
        let idle = self.config.idle_timeout;
        self.buckets
            .lock()
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle);
    }

    pub fn clear(&self) {
        self.buckets.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn test_burst_then_refill() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow(v4(1), now));
        }
        assert!(!limiter.allow(v4(1), now));
        // Another source has its own bucket
        assert!(limiter.allow(v4(2), now));

        // 1/20 s buys exactly one more packet
        let later = now + Duration::from_millis(50);
        assert!(limiter.allow(v4(1), later));
        assert!(!limiter.allow(v4(1), later));
    }

    #[test]
    fn test_ipv6_shares_bucket_per_64() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let now = Instant::now();
        let a: IpAddr = "2001:db8:1:2::1".parse().unwrap();
        let b: IpAddr = "2001:db8:1:2:ffff::9".parse().unwrap();
        let c: IpAddr = "2001:db8:1:3::1".parse().unwrap();

        for _ in 0..5 {
            assert!(limiter.allow(a, now));
        }
        assert!(!limiter.allow(b, now));
        assert!(limiter.allow(c, now));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_table_bound_and_cleanup() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_entries: 2,
            ..Default::default()
        });
        let now = Instant::now();
        assert!(limiter.allow(v4(1), now));
        assert!(limiter.allow(v4(2), now));
        assert!(!limiter.allow(v4(3), now));

        limiter.cleanup(now + Duration::from_secs(2));
        assert!(limiter.is_empty());
        assert!(limiter.allow(v4(3), now + Duration::from_secs(2)));
    }
}
