use std::env;

use color_eyre::eyre::{Result, eyre};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::fmt;

use crate::config::LogConfig;

/// `RUST_LOG` wins over the configured level when it parses.
pub fn filter_for(level: &str) -> Targets {
    let default_filter = format!("hostpulse={level}")
        .parse::<Targets>()
        .unwrap_or_else(|_| Targets::new().with_target("hostpulse", tracing::Level::INFO));
    match env::var("RUST_LOG") {
        Ok(filter) => filter.parse::<Targets>().unwrap_or(default_filter),
        Err(_) => default_filter,
    }
}

pub fn init(config: &LogConfig) -> Result<()> {
    let json_layer = config.json.then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!config.json).then(|| {
        fmt::layer()
            .compact()
            .with_line_number(true)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter_for(&config.level))
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| eyre!("failed to set tracing subscriber: {e}"))
}
