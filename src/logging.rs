//! Subscriber setup for the command-line tools.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Install a global subscriber. `RUST_LOG` overrides `level` when set.
///
/// Logs go to stderr so that plans and reports printed on stdout stay parseable.
pub fn init_logging(level: Level, json_output: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("mpp_core={},warn", level)));

    if json_output {
        let fmt_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);

        let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
    } else {
        let fmt_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

        let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
    }
}
