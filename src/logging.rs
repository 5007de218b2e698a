// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging
//!
//! Installs the global `tracing` subscriber used by pipeline components.

use crate::config::Environment;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Default filter in production when `RUST_LOG` is not set.
pub const PRODUCTION_FILTER: &str = "info,lapin=warn";
/// Default filter in development when `RUST_LOG` is not set.
pub const DEVELOPMENT_FILTER: &str = "debug,lapin=info";

/// Initializes tracing for the given environment.
///
/// - **Production**: JSON lines, flattened events, no module targets.
/// - **Development**: pretty, human readable output.
///
/// `RUST_LOG` overrides the default filter. Calling this more than once is
/// harmless: later calls leave the installed subscriber in place.
pub fn init_tracing(environment: &Environment) {
    let is_production = environment.is_production();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if is_production {
            EnvFilter::new(PRODUCTION_FILTER)
        } else {
            EnvFilter::new(DEVELOPMENT_FILTER)
        }
    });

    let result = if is_production {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(filter)
            .try_init()
    };

    match result {
        Ok(()) => info!(environment = ?environment, "tracing initialized"),
        Err(_) => debug!("tracing already initialized, skipping re-initialization"),
    }
}
