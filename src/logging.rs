//! Tracing subscriber setup. Logs go to stderr so command output on stdout
//! stays machine-readable.

use tracing_subscriber::EnvFilter;

/// Whether `LOG_JSON` asks for JSON logs.
pub fn json_from_env() -> bool {
    std::env::var("LOG_JSON").is_ok_and(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
}

/// Initialize logging once for the process. `RUST_LOG` wins over `verbose`.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(verbose: bool, json: bool) {
    let default = if verbose { "postqueue=debug" } else { "postqueue=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
