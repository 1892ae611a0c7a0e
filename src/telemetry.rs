//! Tracing subscriber setup for the binary.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Filter directive for a `-v` count when `RUST_LOG` is unset.
pub fn default_directive(verbosity: u8, quiet: bool) -> &'static str {
    match (quiet, verbosity) {
        (true, _) => "voicepipe=error",
        (false, 0) => "voicepipe=warn",
        (false, 1) => "voicepipe=debug",
        (false, _) => "voicepipe=trace",
    }
}

/// Installs a stderr fmt subscriber once per process.
pub fn init_tracing(verbosity: u8, quiet: bool) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity, quiet)));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            tracing::debug!("Global tracing subscriber already set");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(0, false), "voicepipe=warn");
        assert_eq!(default_directive(1, false), "voicepipe=debug");
        assert_eq!(default_directive(5, false), "voicepipe=trace");
        assert_eq!(default_directive(2, true), "voicepipe=error");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_tracing(0, false);
        init_tracing(2, false);
    }
}
