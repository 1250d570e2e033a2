//! User-journey policies: reconnect backoff and periodic `tools/list`.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use tokio::time::Instant;

use drill_domain::config::{ReconnectPolicy, UserJourneyConfig};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconnect backoff
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `delay_n = min(max_delay, initial * multiplier^n)` with `±jitter_fraction`
/// uniform noise. Gives up after `max_retries`; any success resets.
pub struct ReconnectBackoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The delay before the next retry, or `None` once retries are exhausted.
    pub fn next_delay(&mut self, rng: &mut StdRng) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        let base = (self.policy.initial_delay_ms as f64
            * self.policy.multiplier.powi(self.attempt as i32))
        .min(self.policy.max_delay_ms as f64);

        let jitter = self.policy.jitter_fraction.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rng.gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        self.attempt += 1;
        Some(Duration::from_millis((base * factor).max(0.0) as u64))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.policy.max_retries
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Journey tracking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decides when a VU should interleave a `tools/list` into its loop:
/// once at startup, on an interval, or after consecutive failures.
pub struct JourneyTracker {
    config: UserJourneyConfig,
    startup_done: bool,
    last_tools_list: Option<Instant>,
    consecutive_failures: u32,
}

impl JourneyTracker {
    pub fn new(config: UserJourneyConfig) -> Self {
        Self {
            config,
            startup_done: false,
            last_tools_list: None,
            consecutive_failures: 0,
        }
    }

    /// Whether to run `tools/list` right now; the caller must then call
    /// [`JourneyTracker::tools_list_ran`].
    pub fn should_run_tools_list(&mut self) -> bool {
        if self.config.startup_tools_list && !self.startup_done {
            return true;
        }
        if self.config.tools_list_after_errors > 0
            && self.consecutive_failures >= self.config.tools_list_after_errors
        {
            return true;
        }
        if self.config.tools_list_interval_ms > 0 {
            let interval = Duration::from_millis(self.config.tools_list_interval_ms);
            return match self.last_tools_list {
                Some(last) => last.elapsed() >= interval,
                None => false, // interval counts from the first operation
            };
        }
        false
    }

    pub fn tools_list_ran(&mut self) {
        self.startup_done = true;
        self.consecutive_failures = 0;
        self.last_tools_list = Some(Instant::now());
    }

    /// Feed every operation outcome in so the failure streak is tracked.
    pub fn note_operation(&mut self, ok: bool) {
        if self.last_tools_list.is_none() && self.config.tools_list_interval_ms > 0 {
            // Anchor the interval at first activity.
            self.last_tools_list = Some(Instant::now());
        }
        if ok {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }
}
