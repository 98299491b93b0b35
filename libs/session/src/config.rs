use std::time::Duration;

use wa_core::ClientIdentity;

/// Timing and identity settings for a [`crate::SessionController`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub identity: ClientIdentity,
    /// Lifetime of a pairing token.
    pub qr_ttl: Duration,
    pub monitor_interval: Duration,
    /// Upper bound on a single `state()` query.
    pub health_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub max_reconnect_attempts: u32,
    pub start_retry_delay: Duration,
    /// How long a started client may stay silent (no pairing token, not ready) before it is
    /// torn down and the reconnect path takes over.
    pub start_timeout: Duration,
    /// Bounded wait for `destroy`/`logout` calls on the client.
    pub client_close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity: ClientIdentity::default(),
            qr_ttl: Duration::from_secs(20),
            monitor_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(5),
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            start_retry_delay: Duration::from_secs(10),
            start_timeout: Duration::from_secs(120),
            client_close_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn with_identity(identity: ClientIdentity) -> Self {
        Self {
            identity,
            ..Self::default()
        }
    }

    /// Delay before reconnect number `attempts + 1`.
    pub fn reconnect_delay(&self, attempts: u32) -> Duration {
        self.reconnect_base
            .saturating_mul(attempts.saturating_add(1))
            .min(self.reconnect_cap)
    }
}
