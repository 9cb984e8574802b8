//! Per-host request spacing.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Hands out the next permitted fetch time per host.
///
/// A caller reserves a slot under the lock and sleeps outside it, so hosts
/// never wait on each other while requests to one host stay spaced by its
/// crawl-delay.
#[derive(Debug)]
pub struct HostGate {
    min_delay: Duration,
    max_delay: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostGate {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.min_delay, self.max_delay)
    }

    /// Reserve a fetch slot for `host` and return how long to wait for it.
    pub fn reserve(&self, host: &str, crawl_delay: Duration) -> Duration {
        let delay = self.clamp(crawl_delay);
        let now = Instant::now();
        let mut slots = self.next_slot.lock();
        let slot = match slots.get(host) {
            Some(next) if *next > now => *next,
            _ => now,
        };
        slots.insert(host.to_string(), slot + delay);
        slot - now
    }

    pub fn hosts(&self) -> usize {
        self.next_slot.lock().len()
    }
}
