use std::time::Duration;

use wa_core::RetryPolicy;

/// Pacing and retry budgets for the orchestrator.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Recipient lookups per contact, each behind a readiness check.
    pub lookup: RetryPolicy,
    /// Attempts per outgoing message; only transient session errors are retried.
    pub send: RetryPolicy,
    pub ready_checks: u32,
    pub ready_delay: Duration,
    /// Readiness checks before and after the forced restart that precedes a media bulk.
    pub recovery_checks: u32,
    pub recovery_settle: Duration,
    /// Wait after a last-resort restart triggered by a dead session during lookup.
    pub reinit_settle: Duration,
    pub contact_gap: Duration,
    pub text_settle: Duration,
    pub attachment_gap: Duration,
    pub fetch_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lookup: RetryPolicy::new(3, Duration::from_secs(2)),
            send: RetryPolicy::new(2, Duration::from_secs(3)),
            ready_checks: 3,
            ready_delay: Duration::from_secs(2),
            recovery_checks: 5,
            recovery_settle: Duration::from_secs(5),
            reinit_settle: Duration::from_secs(5),
            contact_gap: Duration::from_millis(2_500),
            text_settle: Duration::from_millis(500),
            attachment_gap: Duration::from_millis(600),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}
