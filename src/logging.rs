// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use tracing::warn;
use tracing_subscriber::EnvFilter;

const FALLBACK_LEVEL: &str = "info";

/// Builds the log filter from `level`, keeping lapin's connection chatter
/// down unless a directive asks for it.
pub fn build_env_filter(level: &str) -> (EnvFilter, bool) {
    let directives = format!("{level},lapin=warn,amq_protocol=warn");
    match EnvFilter::try_new(&directives) {
        Ok(filter) => (filter, true),
        Err(_) => (
            EnvFilter::new(format!("{FALLBACK_LEVEL},lapin=warn,amq_protocol=warn")),
            false,
        ),
    }
}

/// Installs the global `fmt` subscriber.
pub fn init_logging(level: &str) {
    let (filter, valid) = build_env_filter(level);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    if !valid {
        warn!(level, "invalid log level, falling back to {}", FALLBACK_LEVEL);
    }
}
