mod dyn_err;
mod err_with_sources;

use anyhow::{Context, Result};
use tracing_subscriber::{filter::ParseError, util::SubscriberInitExt, EnvFilter};

pub use dyn_err::{anyhow_dyn_err, std_dyn_err};
pub use err_with_sources::{err_with_sources, ErrorWithSources};

/// Directives that silence crates which are noisy at `debug` and below
/// but almost never what you actually want to see.
///
/// Prepending this means a catch-all directive like `debug` stays
/// readable; any of these crates can still be re-enabled explicitly,
/// e.g. `tokio_tungstenite=debug,debug`.
const IRRELEVANT_CRATES: &str = "tokio_tungstenite=warn,str0m=warn,h2=warn";

/// Registers a global `tracing` subscriber reading directives from
/// `RUST_LOG`, falling back to `default_directives` when unset.
pub fn setup_global_subscriber(default_directives: &str) -> Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| default_directives.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(try_filter(&directives).context("failed to parse log directives")?)
        .finish()
        .try_init()
        .context("could not install global subscriber")?;

    Ok(())
}

/// Constructs an [`EnvFilter`] with [`IRRELEVANT_CRATES`] prepended.
pub fn try_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    if directives.is_empty() {
        return EnvFilter::try_new(IRRELEVANT_CRATES);
    }

    EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
}

/// Initialises a test-scoped subscriber; the returned guard restores
/// the previous subscriber on drop.
pub fn test(directives: &str) -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_prepends_irrelevant_crates() {
        let filter = try_filter("info").unwrap();
        assert!(filter.to_string().contains("tokio_tungstenite=warn"));
        assert!(filter.to_string().contains("info"));
    }

    #[test]
    fn empty_directives_still_parse() {
        assert!(try_filter("").is_ok());
    }
}
