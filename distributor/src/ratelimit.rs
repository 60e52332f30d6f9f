use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter as GovRateLimiter};

use crate::ring::ReadRing;
use crate::validation::Overrides;

/// How long a tenant's bucket parameters are trusted before the strategy is
/// consulted again. Under global rate limiting this is also how quickly a
/// change in distributor count takes effect.
pub const RECHECK_PERIOD: Duration = Duration::from_secs(10);

type DirectLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Where a tenant's effective rate and burst come from. `limit` returns
/// bytes per second; zero means unlimited.
pub trait RateLimiterStrategy: Send + Sync {
    fn limit(&self, tenant: &str) -> u32;
    fn burst(&self, tenant: &str) -> u32;
}

/// Enforce the configured per-tenant rate on this process alone.
pub struct LocalStrategy {
    overrides: Arc<Overrides>,
}

impl LocalStrategy {
    pub fn new(overrides: Arc<Overrides>) -> Self {
        Self { overrides }
    }
}

impl RateLimiterStrategy for LocalStrategy {
    fn limit(&self, tenant: &str) -> u32 {
        self.overrides.limits(tenant).ingestion_rate_bytes
    }

    fn burst(&self, tenant: &str) -> u32 {
        self.overrides.limits(tenant).ingestion_burst_bytes
    }
}

/// Split the configured per-tenant rate evenly across the healthy
/// distributors registered in the distributor ring, recounted on every
/// strategy read.
pub struct GlobalStrategy {
    overrides: Arc<Overrides>,
    distributors: Arc<dyn ReadRing>,
}

impl GlobalStrategy {
    pub fn new(overrides: Arc<Overrides>, distributors: Arc<dyn ReadRing>) -> Self {
        Self {
            overrides,
            distributors,
        }
    }

    fn divisor(&self) -> u32 {
        self.distributors.healthy_instance_count().max(1) as u32
    }
}

impl RateLimiterStrategy for GlobalStrategy {
    fn limit(&self, tenant: &str) -> u32 {
        self.overrides.limits(tenant).ingestion_rate_bytes / self.divisor()
    }

    fn burst(&self, tenant: &str) -> u32 {
        self.overrides.limits(tenant).ingestion_burst_bytes / self.divisor()
    }
}

struct TenantLimiter {
    limiter: DirectLimiter,
    limit: u32,
    burst: u32,
    recheck_at: Instant,
}

/// Per-tenant token buckets. Buckets for distinct tenants live in separate
/// map shards and never share state; admission is a non-blocking check with
/// no queueing, so rejection is final for that request.
pub struct RateLimiter {
    strategy: Arc<dyn RateLimiterStrategy>,
    recheck_period: Duration,
    tenants: DashMap<String, TenantLimiter>,
}

impl RateLimiter {
    pub fn new(strategy: Arc<dyn RateLimiterStrategy>, recheck_period: Duration) -> Self {
        Self {
            strategy,
            recheck_period,
            tenants: DashMap::new(),
        }
    }

    /// Admit or reject `bytes` for `tenant`. Zero-byte requests always pass;
    /// a zero configured limit disables the check for that tenant.
    pub fn allow(&self, tenant: &str, bytes: usize) -> bool {
        let limit = self.strategy.limit(tenant);
        if limit == 0 {
            return true;
        }
        let Some(bytes) = NonZeroU32::new(u32::try_from(bytes).unwrap_or(u32::MAX)) else {
            return true;
        };

        let mut entry = self
            .tenants
            .entry(tenant.to_string())
            .or_insert_with(|| self.build(tenant));

        if Instant::now() >= entry.recheck_at {
            let burst = self.strategy.burst(tenant);
            if limit != entry.limit || burst != entry.burst {
                *entry.value_mut() = self.build(tenant);
            } else {
                entry.recheck_at = Instant::now() + self.recheck_period;
            }
        }

        entry.limiter.check_n(bytes).is_ok()
    }

    /// The tenant's current effective limit in bytes per second, for error
    /// messages.
    pub fn limit(&self, tenant: &str) -> u32 {
        self.strategy.limit(tenant)
    }

    fn build(&self, tenant: &str) -> TenantLimiter {
        let limit = self.strategy.limit(tenant);
        let burst = self.strategy.burst(tenant);
        let quota = Quota::per_second(NonZeroU32::new(limit.max(1)).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN));
        TenantLimiter {
            limiter: GovRateLimiter::direct(quota),
            limit,
            burst,
            recheck_at: Instant::now() + self.recheck_period,
        }
    }
}
