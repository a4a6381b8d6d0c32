//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC session client over WebSocket."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use ems_link_common::ReconnectConfig;
use rand::rngs::StdRng;
use rand::Rng;

/// Exponential reconnect backoff with proportional jitter and a hard cap.
///
/// Attempts are unlimited; only `disconnect()` or a new `connect()` stop them.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Upper bound for any delay, jitter included.
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed, in `[0, 1]`.
    pub jitter: f64,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-indexed).
    pub fn backoff_delay(&self, attempt: u32, rng: &mut StdRng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        if self.jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        base.mul_f64(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(config.base, config.max, config.jitter)
    }
}
