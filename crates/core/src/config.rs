use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, Selector};

/// Runtime configuration for one informer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformerConfig {
    pub selector: Selector,
    /// Period of cached-state re-delivery; `None` disables resync.
    pub resync_period: Option<Duration>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Randomization factor applied to every backoff interval, in `[0, 1)`.
    pub backoff_jitter: f64,
    /// Consecutive watch failures after which the reflector relists.
    pub max_watch_failures: u32,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            selector: Selector::default(),
            resync_period: Some(Duration::from_secs(300)),
            initial_backoff: Duration::from_millis(800),
            max_backoff: Duration::from_secs(30),
            backoff_jitter: 0.2,
            max_watch_failures: 5,
        }
    }
}

impl InformerConfig {
    pub fn selector(mut self, selector: Selector) -> Self { self.selector = selector; self }
    pub fn resync_period(mut self, period: Option<Duration>) -> Self { self.resync_period = period; self }
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
    pub fn backoff_jitter(mut self, jitter: f64) -> Self { self.backoff_jitter = jitter; self }
    pub fn max_watch_failures(mut self, n: u32) -> Self { self.max_watch_failures = n; self }

    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(Error::Configuration("initial backoff must be greater than zero".into()));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(Error::Configuration(format!(
                "max backoff {:?} is below initial backoff {:?}",
                self.max_backoff, self.initial_backoff
            )));
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            return Err(Error::Configuration(format!("backoff jitter {} outside [0, 1)", self.backoff_jitter)));
        }
        if self.max_watch_failures == 0 {
            return Err(Error::Configuration("max watch failures must be at least 1".into()));
        }
        if matches!(self.resync_period, Some(p) if p.is_zero()) {
            return Err(Error::Configuration("resync period must be non-zero (use None to disable)".into()));
        }
        self.selector.validate()
    }

    /// Exponential policy (x2) capped at `max_backoff`, jittered, never giving up.
    pub fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(self.backoff_jitter)
            .with_max_elapsed_time(None)
            .build()
    }
}
