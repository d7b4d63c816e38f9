use std::env;
use std::num::ParseIntError;

#[derive(Debug, Clone)]
pub struct Config {
    pub rust_log: String,
    /// STUN server used when a join ticket carries no ICE servers.
    pub stun_fallback_url: String,
    /// Timeout for opening the signaling transport, in milliseconds.
    pub connect_timeout_ms: u64,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidTimeout(String, ParseIntError),
    TimeoutOutOfRange(u64),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidTimeout(val, err) => {
                write!(
                    f,
                    "CONNECT_TIMEOUT_MS must be a valid integer (got '{}': {})",
                    val, err
                )
            }
            ConfigError::TimeoutOutOfRange(ms) => {
                write!(f, "CONNECT_TIMEOUT_MS must be greater than 0 (got {})", ms)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Validates environment variables and returns a Config object.
/// Returns an error if any present variable is invalid.
pub fn validate_env() -> Result<Config, ConfigError> {
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| {
        tracing::warn!("RUST_LOG not set, using default: info");
        "info".to_string()
    });

    let stun_fallback_url =
        env::var("STUN_FALLBACK_URL").unwrap_or_else(|_| DEFAULT_STUN_URL.to_string());

    let connect_timeout_ms = match env::var("CONNECT_TIMEOUT_MS") {
        Ok(val) => {
            let ms: u64 = val
                .parse()
                .map_err(|e| ConfigError::InvalidTimeout(val.clone(), e))?;
            if ms == 0 {
                return Err(ConfigError::TimeoutOutOfRange(ms));
            }
            ms
        }
        Err(_) => DEFAULT_CONNECT_TIMEOUT_MS,
    };

    let config = Config {
        rust_log,
        stun_fallback_url,
        connect_timeout_ms,
    };

    tracing::info!(
        rust_log = config.rust_log,
        stun_fallback = config.stun_fallback_url,
        connect_timeout_ms = config.connect_timeout_ms,
        "Configuration validated"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    // Helper to set up and tear down environment variables for tests
    struct EnvGuard<'a> {
        vars: Vec<String>,
        _guard: std::sync::MutexGuard<'a, ()>,
    }

    impl<'a> EnvGuard<'a> {
        fn new() -> Self {
            let guard = ENV_MUTEX.lock().unwrap();
            EnvGuard {
                vars: Vec::new(),
                _guard: guard,
            }
        }

        fn set(&mut self, key: &str, value: &str) {
            env::set_var(key, value);
            self.vars.push(key.to_string());
        }

        fn unset(&mut self, key: &str) {
            env::remove_var(key);
            self.vars.push(key.to_string());
        }
    }

    impl<'a> Drop for EnvGuard<'a> {
        fn drop(&mut self) {
            for var in &self.vars {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_validate_env_defaults() {
        let mut guard = EnvGuard::new();
        guard.unset("RUST_LOG");
        guard.unset("STUN_FALLBACK_URL");
        guard.unset("CONNECT_TIMEOUT_MS");

        let config = validate_env().expect("Expected valid configuration");
        assert_eq!(config.rust_log, "info");
        assert_eq!(config.stun_fallback_url, DEFAULT_STUN_URL);
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
    }

    #[test]
    fn test_validate_env_explicit_values() {
        let mut guard = EnvGuard::new();
        guard.set("RUST_LOG", "debug");
        guard.set("STUN_FALLBACK_URL", "stun:stun.example.org:3478");
        guard.set("CONNECT_TIMEOUT_MS", "2500");

        let config = validate_env().expect("Expected valid configuration");
        assert_eq!(config.rust_log, "debug");
        assert_eq!(config.stun_fallback_url, "stun:stun.example.org:3478");
        assert_eq!(config.connect_timeout_ms, 2500);
    }

    #[test]
    fn test_validate_env_invalid_timeout() {
        let mut guard = EnvGuard::new();
        guard.set("CONNECT_TIMEOUT_MS", "not-a-number");

        let err = validate_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimeout(_, _)));
        assert!(err.to_string().contains("must be a valid integer"));
    }

    #[test]
    fn test_validate_env_zero_timeout() {
        let mut guard = EnvGuard::new();
        guard.set("CONNECT_TIMEOUT_MS", "0");

        let err = validate_env().unwrap_err();
        assert!(matches!(err, ConfigError::TimeoutOutOfRange(0)));
    }
}
