use std::sync::Once;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod fetch_process;

static LOG_INIT: Once = Once::new();

/// Install a global tracing subscriber once per test binary.
/// `RUST_LOG` takes precedence over `default_directive`.
pub(crate) fn log_init(default_directive: &str) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));
        let format = tracing_subscriber::fmt::layer()
            .with_level(true)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_test_writer()
            .compact();
        // another test harness may already have installed a subscriber
        drop(
            tracing_subscriber::registry()
                .with(filter)
                .with(format)
                .try_init(),
        );
    });
}
