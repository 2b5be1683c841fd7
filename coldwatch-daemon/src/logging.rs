// Coldwatch Daemon - Logging setup
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Tracing subscriber with a reloadable level filter.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Parse a level name, defaulting to INFO
pub fn parse_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::default().add_directive(level.into())
}

/// Switches the live filter between INFO and WARN
pub struct LevelToggle {
    handle: reload::Handle<EnvFilter, Registry>,
    quiet: bool,
}

impl LevelToggle {
    /// Flip the level; returns the level now in force
    pub fn toggle(&mut self) -> Result<Level, reload::Error> {
        let next = if self.quiet { Level::INFO } else { Level::WARN };
        self.handle.reload(filter_for(next))?;
        self.quiet = !self.quiet;
        Ok(next)
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over `level` when set.
pub fn init(level: &str) -> LevelToggle {
    let level = parse_level(level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    LevelToggle {
        handle,
        quiet: level == Level::WARN,
    }
}
