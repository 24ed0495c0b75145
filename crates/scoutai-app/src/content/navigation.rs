// In-page navigation detection for single-page applications.
//
// There is no in-page navigation event that every supported platform fires,
// so the content script samples the URL on a fixed interval. A change arms a
// settle timer; the page is re-evaluated only when that timer fires, because
// client-side routers update the URL before the new view has rendered.
//
// Nothing here owns a timer. The caller feeds samples and instants, which
// keeps the logic testable with synthetic URL sequences.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Reports when a sampled value differs from the previous sample.
#[derive(Debug, Clone)]
pub struct ChangeWatcher<T> {
    last: T,
}

impl<T: PartialEq + Clone> ChangeWatcher<T> {
    pub fn new(initial: T) -> Self {
        ChangeWatcher { last: initial }
    }

    /// Record `current`. Returns it if it differs from the previous sample.
    pub fn sample(&mut self, current: T) -> Option<T> {
        if current == self.last {
            return None;
        }
        self.last = current.clone();
        Some(current)
    }

    pub fn last(&self) -> &T {
        &self.last
    }
}

/// URL sampler with a settle delay.
#[derive(Debug, Clone)]
pub struct NavigationWatcher {
    url: ChangeWatcher<String>,
    poll_interval: Duration,
    settle_delay: Duration,
    settle_at: Option<Instant>,
}

impl NavigationWatcher {
    pub fn new(initial_url: impl Into<String>, poll_interval: Duration, settle_delay: Duration) -> Self {
        NavigationWatcher {
            url: ChangeWatcher::new(initial_url.into()),
            poll_interval,
            settle_delay,
            settle_at: None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn last_url(&self) -> &str {
        self.url.last()
    }

    /// Feed one URL sample taken at `now`. A change (re)arms the settle
    /// timer, so a burst of changes is evaluated once, after the last one.
    /// Returns `true` if the URL changed.
    pub fn observe(&mut self, url: &str, now: Instant) -> bool {
        match self.url.sample(url.to_string()) {
            Some(changed) => {
                debug!(url = %changed, "URL changed, waiting {:?} to settle", self.settle_delay);
                self.settle_at = Some(now + self.settle_delay);
                true
            }
            None => false,
        }
    }

    /// When the pending re-evaluation is due, if one is pending.
    pub fn settle_deadline(&self) -> Option<Instant> {
        self.settle_at
    }

    /// Consume the pending re-evaluation if it is due at `now`.
    pub fn take_settled(&mut self, now: Instant) -> bool {
        match self.settle_at {
            Some(at) if at <= now => {
                self.settle_at = None;
                true
            }
            _ => false,
        }
    }

    /// Drop any pending re-evaluation.
    pub fn cancel_settle(&mut self) {
        self.settle_at = None;
    }
}
