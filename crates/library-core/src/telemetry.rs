//! Log subscriber setup for the pipeline binary.
//!
//! Workspace crates log at the requested level; the storage and HTTP stacks
//! underneath stay at `warn` unless `RUST_LOG` says otherwise. In JSON mode
//! every line carries the fields of the enclosing `library.chain` span, so a
//! chain run can be followed by its `run_id`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const WORKSPACE_TARGETS: &[&str] = &[
    "library",
    "library_core",
    "library_state",
    "library_github",
    "library_pipeline",
];

const DEPENDENCY_TARGETS: &[&str] = &["surrealdb", "surrealkv", "hyper", "reqwest", "octocrab"];

/// Output shape of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines for a terminal.
    Pretty,
    /// Newline-delimited JSON for log shipping.
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Filter directives used when `RUST_LOG` is unset.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    WORKSPACE_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .chain(DEPENDENCY_TARGETS.iter().map(|target| format!("{target}=warn")))
        .chain(std::iter::once("warn".to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_tracing(format: LogFormat, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_quiet_dependencies() {
        let directives = default_directives(Level::DEBUG);
        assert!(directives.contains("library_pipeline=debug"));
        assert!(directives.contains("library_state=debug"));
        assert!(directives.contains("surrealdb=warn"));
        assert!(directives.ends_with(",warn"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_json_flag_selects_format() {
        assert_eq!(LogFormat::from_json_flag(true), LogFormat::Json);
        assert_eq!(LogFormat::from_json_flag(false), LogFormat::Pretty);
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing(LogFormat::Pretty, Level::INFO);
        init_tracing(LogFormat::Json, Level::DEBUG);
    }
}
