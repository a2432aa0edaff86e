// * Per-Domain Gate
// * Caps concurrent requests per domain and optionally applies a request-rate quota

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorLimiter};
use nonzero_ext::nonzero;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, warn};

// * Warn once the domain map passes this many entries (entries are never evicted)
const DOMAIN_MAP_WARN_THRESHOLD: usize = 10_000;

// * Concurrency slot plus optional quota for a single domain
pub struct DomainSlot {
    domain: String,
    semaphore: Arc<Semaphore>,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl DomainSlot {
    fn new(domain: &str, concurrency: usize, requests_per_second: u32) -> Self {
        let limiter = NonZeroU32::new(requests_per_second)
            .map(|rps| GovernorLimiter::direct(Quota::per_second(rps).allow_burst(nonzero!(1u32))));

        Self {
            domain: domain.to_string(),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            limiter,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    // * Slots not currently held
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

// * DomainGate hands out per-domain permits, creating slots lazily on first use
pub struct DomainGate {
    per_site_concurrency: usize,
    requests_per_second: u32,
    slots: Arc<RwLock<HashMap<String, Arc<DomainSlot>>>>,
}

impl DomainGate {
    // * @param per_site_concurrency - max in-flight requests per domain (at least 1)
    // * @param requests_per_second - per-domain quota, 0 disables it
    pub fn new(per_site_concurrency: usize, requests_per_second: u32) -> Self {
        Self {
            per_site_concurrency: per_site_concurrency.max(1),
            requests_per_second,
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // * Gets or creates the slot for a domain
    pub async fn slot(&self, domain: &str) -> Arc<DomainSlot> {
        let slots = self.slots.read().await;
        if let Some(slot) = slots.get(domain) {
            return Arc::clone(slot);
        }
        drop(slots);

        let mut slots = self.slots.write().await;
        // * Another worker may have created it between the two locks
        if let Some(slot) = slots.get(domain) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(DomainSlot::new(
            domain,
            self.per_site_concurrency,
            self.requests_per_second,
        ));
        slots.insert(domain.to_string(), Arc::clone(&slot));
        debug!(domain, concurrency = self.per_site_concurrency, "Registered domain slot");

        if slots.len() == DOMAIN_MAP_WARN_THRESHOLD {
            warn!(domains = slots.len(), "Domain slot map is large and is never evicted");
        }

        slot
    }

    // * Waits for a concurrency slot, then for the quota. The permit is released on drop.
    // * None only if the slot semaphore was closed.
    pub async fn acquire(&self, domain: &str) -> Option<OwnedSemaphorePermit> {
        let slot = self.slot(domain).await;
        let permit = Arc::clone(&slot.semaphore).acquire_owned().await.ok()?;
        if let Some(limiter) = &slot.limiter {
            limiter.until_ready().await;
        }
        Some(permit)
    }

    pub async fn tracked_domains(&self) -> usize {
        self.slots.read().await.len()
    }
}
