//! Diagnostic logging on stderr.
//!
//! User-facing progress is printed from engine events; tracing output is for
//! diagnosis, so the default level is `warn`. `--debug` raises the miner's own
//! crates to `debug`, which includes every line exchanged with the pool.
//! `RUST_LOG` overrides both.

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

const DEBUG_DIRECTIVES: &str = "hds_miner=debug,hds_miner_engine=debug,hds_miner_core=debug";

fn filter(debug: bool) -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        return EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .from_env_lossy();
    }
    if debug {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .parse_lossy(DEBUG_DIRECTIVES)
    } else {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .parse_lossy("")
    }
}

pub fn init(debug: bool) {
    tracing_subscriber::registry()
        .with(filter(debug))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .init();
}
