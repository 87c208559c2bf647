#![forbid(unsafe_code)]

use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "tr_runner=info,tr_storage=info";

/// First non-blank directive string: `TR_LOG`, then `RUST_LOG`, then the default.
fn pick_directives(tr_log: Option<String>, rust_log: Option<String>) -> String {
    [tr_log, rust_log]
        .into_iter()
        .flatten()
        .find(|raw| !raw.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

pub fn env_filter() -> EnvFilter {
    let directives = pick_directives(std::env::var("TR_LOG").ok(), std::env::var("RUST_LOG").ok());
    EnvFilter::try_new(&directives).unwrap_or_else(|err| {
        eprintln!("ignoring invalid log filter {directives:?}: {err}");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// Install the global fmt subscriber on stderr. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
