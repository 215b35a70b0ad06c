//! Tracing initialization.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

pub fn is_test_env() -> bool {
    std::env::var_os("WEFT_TESTING").is_some() || std::env::var_os("RUST_TEST_THREADS").is_some()
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops. Verbosity stacks on top of the configured filter (`-v` debug,
/// `-vv` trace).
pub fn init(verbosity: u8, logging: &LoggingConfig) {
    let directive = match verbosity {
        0 => logging.filter.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_env("WEFT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(directive));

    let builder = fmt().with_env_filter(filter).with_target(false);
    let result = match logging.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    // Already-initialized is fine (tests, embedding applications).
    let _ = result;
}
