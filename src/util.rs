use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

/// Identifier sent as `middlewareSource` on every metering payload.
pub const MIDDLEWARE_SOURCE: &str = "revenium-middleware-google-rust";

/// `User-Agent` header for metering requests.
pub fn user_agent() -> String {
    format!("{}/{}", MIDDLEWARE_SOURCE, env!("CARGO_PKG_VERSION"))
}

/// Initialize structured tracing.
///
/// RUST_LOG wins when set. Otherwise the debug flag selects between
/// `revenium_google=debug` and `info`. Safe to call more than once; a
/// subscriber installed by the host is left in place.
pub fn init_tracing(debug_enabled: bool) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if debug_enabled {
            "info,revenium_google=debug".into()
        } else {
            "info".into()
        }
    });
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::debug!(debug_enabled, "tracing initialized");
    }
}

/// Interpret a flag value: 1|true|yes|on (case-insensitive) are true.
pub fn parse_flag(value: &str) -> bool {
    let v = value.trim().to_ascii_lowercase();
    v == "1" || v == "true" || v == "yes" || v == "on"
}

/// Read a boolean flag from the environment; unset means false.
pub fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| parse_flag(&v)).unwrap_or(false)
}

/// Read a trimmed, non-empty environment variable.
pub fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Build the HTTP client used for metering delivery.
///
/// The timeout bounds each individual attempt, not the whole retry sequence.
/// Environment:
/// - REVENIUM_NO_PROXY = 1|true|yes|on  -> disable system proxies
pub fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent())
        .pool_idle_timeout(Duration::from_secs(60));

    if env_flag("REVENIUM_NO_PROXY") {
        builder = builder.no_proxy();
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        for v in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(parse_flag(v), "{v} should be on");
        }
        for v in ["", "0", "false", "off", "enabled"] {
            assert!(!parse_flag(v), "{v} should be off");
        }
    }

    #[test]
    fn init_tracing_is_repeatable() {
        init_tracing(true);
        init_tracing(false);
        tracing::debug!(attempt = 1, "still logging after second init");
    }

    #[test]
    fn user_agent_carries_version() {
        let ua = user_agent();
        assert!(ua.starts_with("revenium-middleware-google-rust/"));
        assert!(ua.ends_with(env!("CARGO_PKG_VERSION")));
    }
}
