//! Environment configuration surface for the push pipeline.

use std::env;
use std::time::Duration;

/// Redis channel carrying credit change events.
pub const DEFAULT_EVENTS_CHANNEL: &str = "credit:events";

const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Everything the pipeline reads from the environment.
///
/// An absent `redis_url` puts the change bus in single-instance mode (local
/// in-process dispatch only). An absent `jwt_secret` means tokens are
/// resolved through the identity provider, or through whatever
/// [`TokenValidator`](crate::auth::TokenValidator) the embedding application
/// supplies.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub redis_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub identity_provider_url: Option<String>,
    pub identity_provider_key: Option<String>,
    pub events_channel: String,
    /// Bound on token validation during connection setup.
    pub auth_timeout: Duration,
    /// Bound on balance-provider calls during dispatch and initial pushes.
    pub snapshot_timeout: Duration,
    /// Hint returned to polling clients, in seconds.
    pub poll_interval_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            jwt_secret: None,
            identity_provider_url: None,
            identity_provider_key: None,
            events_channel: DEFAULT_EVENTS_CHANNEL.to_string(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl PushConfig {
    /// Reads `REDIS_URL`, `JWT_SECRET`, `IDENTITY_PROVIDER_URL`,
    /// `IDENTITY_PROVIDER_KEY` and `POLL_INTERVAL_SECS`, falling back to the
    /// defaults above.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: non_empty_var("REDIS_URL"),
            jwt_secret: non_empty_var("JWT_SECRET"),
            identity_provider_url: non_empty_var("IDENTITY_PROVIDER_URL"),
            identity_provider_key: non_empty_var("IDENTITY_PROVIDER_KEY"),
            poll_interval_secs: non_empty_var("POLL_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ..defaults
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_single_instance() {
        let config = PushConfig::default();
        assert!(config.redis_url.is_none());
        assert_eq!(config.events_channel, DEFAULT_EVENTS_CHANNEL);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
    }

    #[test]
    fn poll_interval_has_floor() {
        let config = PushConfig {
            poll_interval_secs: 0,
            ..PushConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }
}
