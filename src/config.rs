use std::sync::OnceLock;

static INVALID_ENV_LOGGED: OnceLock<()> = OnceLock::new();

/// Tunables for the aggregation engine. Defaults are safe for an embedded
/// single-node deployment; every field can be overridden from the
/// environment.
#[derive(Debug, Clone)]
pub struct CubeConfig {
    /// Attempts per atomic unit before escalating to a rebuild.
    pub max_apply_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub backoff_base_ms: u64,
    /// Batch size at which callers should prefer the bulk path over
    /// per-entry delta processing.
    pub bulk_threshold: usize,
    /// Number of most recent periods (per period type) a reconciliation
    /// run inspects.
    pub reconcile_window: u32,
}

impl Default for CubeConfig {
    fn default() -> Self {
        Self {
            max_apply_attempts: 3,
            backoff_base_ms: 50,
            bulk_threshold: 25,
            reconcile_window: 3,
        }
    }
}

impl CubeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_apply_attempts: read_env("LEDGERCUBE_MAX_ATTEMPTS", defaults.max_apply_attempts),
            backoff_base_ms: read_env("LEDGERCUBE_BACKOFF_MS", defaults.backoff_base_ms),
            bulk_threshold: read_env("LEDGERCUBE_BULK_THRESHOLD", defaults.bulk_threshold),
            reconcile_window: read_env("LEDGERCUBE_RECONCILE_WINDOW", defaults.reconcile_window),
        }
    }

    /// Exponential backoff delay for a 1-based attempt number.
    pub fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(6);
        std::time::Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

fn read_env<T>(var: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(var) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                if INVALID_ENV_LOGGED.set(()).is_ok() {
                    tracing::warn!(
                        target: "ledgercube",
                        event = "config_env_invalid",
                        var = %var,
                        value = %raw,
                        "falling back to default"
                    );
                }
                default
            }
        },
        Err(_) => default,
    }
}
