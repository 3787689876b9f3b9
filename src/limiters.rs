use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Error;
use crate::util::lock_unpoisoned;

const PER_HOST_LIMITER_ENTRY_TTL: Duration = Duration::from_secs(300);
const PER_HOST_LIMITER_MAX_ENTRIES: usize = 1024;

/// Caps concurrent exchanges per `host:port`.
#[derive(Clone, Debug)]
pub(crate) struct HostConnectionLimiter {
    per_host_limit: usize,
    per_host: Arc<Mutex<BTreeMap<String, PerHostLimiterEntry>>>,
}

#[derive(Clone, Debug)]
struct PerHostLimiterEntry {
    semaphore: Arc<Semaphore>,
    last_used_at: Instant,
}

impl PerHostLimiterEntry {
    fn is_idle(&self, limit: usize) -> bool {
        self.semaphore.available_permits() == limit
    }
}

#[derive(Debug)]
pub(crate) struct HostPermit {
    _permit: OwnedSemaphorePermit,
}

impl HostConnectionLimiter {
    /// `None` when the limit is zero (unlimited).
    pub(crate) fn new(per_host_limit: usize) -> Option<Self> {
        (per_host_limit > 0).then(|| Self {
            per_host_limit,
            per_host: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    pub(crate) async fn acquire(&self, host: &str) -> Result<HostPermit, Error> {
        let semaphore = {
            let mut guard = lock_unpoisoned(&self.per_host);
            let now = Instant::now();
            cleanup_stale_per_host_limiters(&mut guard, self.per_host_limit, now);
            let entry = guard
                .entry(host.to_ascii_lowercase())
                .or_insert_with(|| PerHostLimiterEntry {
                    semaphore: Arc::new(Semaphore::new(self.per_host_limit)),
                    last_used_at: now,
                });
            entry.last_used_at = now;
            Arc::clone(&entry.semaphore)
        };
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::ConcurrencyLimitClosed {
                host: host.to_owned(),
            })?;
        Ok(HostPermit { _permit: permit })
    }

    #[cfg(test)]
    fn tracked_hosts(&self) -> usize {
        lock_unpoisoned(&self.per_host).len()
    }
}

fn cleanup_stale_per_host_limiters(
    entries: &mut BTreeMap<String, PerHostLimiterEntry>,
    limit: usize,
    now: Instant,
) {
    entries.retain(|_, entry| {
        !entry.is_idle(limit) || now.duration_since(entry.last_used_at) <= PER_HOST_LIMITER_ENTRY_TTL
    });

    while entries.len() > PER_HOST_LIMITER_MAX_ENTRIES {
        let oldest_key = entries
            .iter()
            .filter(|(_, entry)| entry.is_idle(limit))
            .min_by_key(|(_, entry)| entry.last_used_at)
            .map(|(host, _)| host.clone());
        let Some(oldest_key) = oldest_key else {
            break;
        };
        entries.remove(&oldest_key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::HostConnectionLimiter;

    #[test]
    fn zero_limit_disables_limiter() {
        assert!(HostConnectionLimiter::new(0).is_none());
    }

    #[tokio::test]
    async fn permits_are_bounded_per_host() {
        let limiter = HostConnectionLimiter::new(1).expect("limit is positive");
        let first = limiter.acquire("a.example.com:443").await.expect("first permit");

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            limiter.acquire("A.example.com:443"),
        )
        .await;
        assert!(blocked.is_err(), "second permit for the same host should wait");

        limiter
            .acquire("b.example.com:443")
            .await
            .expect("other hosts are independent");
        drop(first);
        limiter
            .acquire("a.example.com:443")
            .await
            .expect("permit is released on drop");
        assert_eq!(limiter.tracked_hosts(), 2);
    }
}
