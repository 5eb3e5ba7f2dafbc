//! Support library of the rackmon agent binary.
//!
//! Holds what the binary needs besides the core crate: logger setup and the
//! configuration file format (see [`config`]).

use env_logger::Env;

pub mod config;

/// Initializes the global logger.
///
/// The default level is `info`; the `--debug` and `--trace` flags raise it.
/// `RUST_LOG` takes precedence over everything when set.
pub fn init_logger(debug: bool, trace: bool) {
    let default = if trace {
        "trace"
    } else if debug {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(default)).init();
}
