use std::time::Duration;

use sluice_core::config::MonitorConfig;

/// Exponential backoff for monitor scan failures.
pub fn calculate_backoff(attempt: u32, config: &MonitorConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
