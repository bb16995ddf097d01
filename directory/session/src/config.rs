//! Configuration for a session engine instance.

use std::time::Duration;

/// Smallest session timeout the engine will request
pub const MIN_SESSION_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest session timeout the engine will request
pub const MAX_SESSION_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for a directory session engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Requested session timeout; the server may renegotiate it.
    /// Keepalive pings go out at half this interval, and an idle receive
    /// gap longer than it forces a reopen.
    pub session_timeout: Duration,
    /// Deadline for a transport connect plus handshake attempt
    pub connect_timeout: Duration,
    /// Fixed pause before each reconnect attempt
    pub reconnect_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Session timeout clamped into the supported bounds
    pub fn clamped_session_timeout(&self) -> Duration {
        self.session_timeout
            .clamp(MIN_SESSION_TIMEOUT, MAX_SESSION_TIMEOUT)
    }

    /// Interval between keepalive checks (half the session timeout)
    pub fn ping_interval(&self) -> Duration {
        self.clamped_session_timeout() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_clamping() {
        let config = EngineConfig {
            session_timeout: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        assert_eq!(config.clamped_session_timeout(), MIN_SESSION_TIMEOUT);

        let config = EngineConfig {
            session_timeout: Duration::from_secs(600),
            ..EngineConfig::default()
        };
        assert_eq!(config.clamped_session_timeout(), MAX_SESSION_TIMEOUT);
        assert_eq!(config.ping_interval(), MAX_SESSION_TIMEOUT / 2);
    }
}
