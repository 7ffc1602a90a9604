//! Log setup for the `ethos` binary.
//!
//! Logs go to stderr so stdout stays parseable. `RUST_LOG` wins over the
//! configured `[log] level`; `-v` flags raise the level further.

use tracing_subscriber::{fmt, EnvFilter};

/// Resolve the filter directive from verbosity and the configured level.
pub fn filter_directive(verbose: u8, configured: &str) -> String {
    match verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Install the global subscriber. Safe to call more than once.
pub fn init(verbose: u8, configured: &str) {
    let filter = if verbose == 0 {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(filter_directive(0, configured)))
    } else {
        EnvFilter::new(filter_directive(verbose, configured))
    };

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .try_init();
}
