//! Log output for the command-line tool.
//!
//! Events go to stderr so converted XML can be piped through stdout. The
//! filter comes from `RUST_LOG` when set, otherwise from the `-v` count.

use tracing_subscriber::EnvFilter;

/// Default filter for a `-v` count: none is `info`, one `debug`, more `trace`.
pub fn default_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Initialize structured logging to stderr.
///
/// `RUST_LOG` wins over the verbosity flag when it is set.
pub fn init(verbosity: u8) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbosity)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
