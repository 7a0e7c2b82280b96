// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Tracing subscriber setup for processes embedding the fleet core.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::domain::config::ObservabilityConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `level` when set. `format` is `"compact"` or
/// `"json"`. Installing twice is not an error; the first subscriber stays.
pub fn init_tracing(level: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match format {
        "json" => builder.json().try_init(),
        _ => builder.compact().try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}

pub fn init_from_config(config: &ObservabilityConfig) -> Result<()> {
    init_tracing(&config.log_level, &config.log_format)
}
