#![no_main]

use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use kiln_retry::{BackoffConfig, BackoffStrategy, calculate_delay};

fuzz_target!(|data: (u32, u8, u64, u64, u8)| {
    let (attempt, strategy_byte, base_ms, max_ms, jitter_byte) = data;

    let attempt = attempt % 100 + 1;
    let strategy = match strategy_byte % 4 {
        0 => BackoffStrategy::Immediate,
        1 => BackoffStrategy::Exponential,
        2 => BackoffStrategy::Linear,
        _ => BackoffStrategy::Constant,
    };
    let config = BackoffConfig {
        strategy,
        max_retries: 100,
        base_delay: Duration::from_millis(base_ms % 10_000 + 1),
        max_delay: Duration::from_millis(max_ms % 300_000 + 100),
        jitter: (jitter_byte as f64) / 255.0,
    };

    let delay = calculate_delay(&config, attempt);
    // Jitter is bounded by 2x the cap.
    assert!(delay <= config.max_delay * 2);
});
