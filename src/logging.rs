// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Protocol traffic logs at `trace!`, lifecycle transitions at `debug!`, and
//! fatal divergence at `error!`. The filter is driven by the `LOCKSTEP_LOG`
//! environment variable (standard `tracing` directive syntax).

use std::sync::Once;

use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "LOCKSTEP_LOG";
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

/// Initialize the logger. Later calls are no-ops, so libraries and tests can
/// call this unconditionally.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(
            DEFAULT_FILTER_LEVEL
                .parse()
                .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
