//! Global tracing subscriber setup.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Map a llama.cpp-style `--log-verbosity` to a tracing filter directive.
pub fn level_for_verbosity(verbosity: i32) -> &'static str {
    match verbosity {
        v if v < 0 => "error",
        0 => "info",
        _ => "debug",
    }
}

/// Install the global subscriber once. `RUST_LOG` takes precedence.
pub fn init(verbosity: i32) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)));
        // Another subscriber may already be installed by the host process
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for_verbosity(-1), "error");
        assert_eq!(level_for_verbosity(0), "info");
        assert_eq!(level_for_verbosity(3), "debug");
    }
}
