use std::env;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

/// Client core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a remote actor stays "typing" without a fresh start signal
    pub typing_expiry: Duration,
    /// Delay between a stop signal and removing the actor from the typing set
    pub typing_stop_debounce: Duration,
    /// Minimum spacing between outbound typing-start emissions
    pub typing_emit_interval: Duration,
    /// Check outbound events against the allow-list (advisory only)
    pub validate_outbound: bool,
    /// Enable development-time consistency guards
    pub guards: bool,
    /// Number of settled mutation records kept for inspection
    pub mutation_history: usize,
    pub log_filter: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            typing_expiry: env_millis("LAGOON_TYPING_EXPIRY_MS").unwrap_or(defaults.typing_expiry),
            typing_stop_debounce: env_millis("LAGOON_TYPING_STOP_DEBOUNCE_MS")
                .unwrap_or(defaults.typing_stop_debounce),
            typing_emit_interval: env_millis("LAGOON_TYPING_EMIT_INTERVAL_MS")
                .unwrap_or(defaults.typing_emit_interval),
            validate_outbound: env_flag("LAGOON_VALIDATE_OUTBOUND")
                .unwrap_or(defaults.validate_outbound),
            // Guards never run in release builds, whatever the environment says.
            guards: cfg!(debug_assertions) && env_flag("LAGOON_GUARDS").unwrap_or(defaults.guards),
            mutation_history: env::var("LAGOON_MUTATION_HISTORY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.mutation_history),
            log_filter: env::var("RUST_LOG").unwrap_or(defaults.log_filter),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            typing_expiry: Duration::from_millis(5_000),
            typing_stop_debounce: Duration::from_millis(600),
            typing_emit_interval: Duration::from_millis(2_000),
            validate_outbound: cfg!(debug_assertions),
            guards: cfg!(debug_assertions),
            mutation_history: 256,
            log_filter: "info,lagoon_client_core=debug".to_string(),
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn env_flag(var: &str) -> Option<bool> {
    env::var(var)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
}
