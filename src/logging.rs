//! Tracing subscriber setup for the `testbed` binary.

use tracing_subscriber::EnvFilter;

/// Creates a filter from `RUST_LOG` when set, otherwise from the number of
/// `-v` flags.
#[must_use]
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directive(verbosity))
    }
}

/// Directive used when `RUST_LOG` is not set.
#[must_use]
pub const fn filter_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "testbed=warn",
        1 => "testbed=info",
        2 => "testbed=debug",
        _ => "testbed=trace",
    }
}

/// Installs a console subscriber writing to stderr.
///
/// Does nothing when a global subscriber is already installed.
pub fn init(verbosity: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(create_env_filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}
