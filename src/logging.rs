//! Process-wide tracing setup.

use crate::error::{BrokerError, Result};
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// timestamp LEVEL target - message
    Compact,
    /// JSON lines
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "json" | "jsonl" => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Base level plus quieter defaults for chatty dependencies.
fn build_env_filter(level: &str) -> Result<EnvFilter> {
    let mut directives = vec![level.to_string()];
    for (target, lvl) in [("rskafka", "warn"), ("h2", "warn"), ("tokio_util", "warn")] {
        directives.push(format!("{target}={lvl}"));
    }
    let filter = directives.join(",");
    EnvFilter::try_new(&filter)
        .map_err(|e| BrokerError::Config(format!("invalid log filter '{filter}': {e}")))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(level: &str, format: LogFormat) -> Result<()> {
    let filter = build_env_filter(level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|e| BrokerError::Config(format!("logging already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Compact);
    }

    #[test]
    fn test_bad_level_rejected() {
        assert!(build_env_filter("info").is_ok());
        assert!(matches!(
            build_env_filter("updatecast=verbose"),
            Err(BrokerError::Config(_))
        ));
    }
}
