use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber once. Filter comes from `LEDGERCUBE_LOG`
/// (falling back to `RUST_LOG`, then `info`). Safe to call from tests and
/// embedding applications alike; later calls are no-ops.
pub fn init() {
    INIT.get_or_init(|| {
        let filter = std::env::var("LEDGERCUBE_LOG")
            .ok()
            .and_then(|raw| raw.parse::<EnvFilter>().ok())
            .unwrap_or_else(|| EnvFilter::from_default_env().add_directive("info".parse().expect("valid directive")));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
