//! Pure session lifecycle state machine.
//!
//! [`SessionMachine::apply`] consumes one [`SessionEvent`] and returns the [`Effect`]s the driver
//! must execute. It performs no I/O and reads no clock; time enters through event payloads and
//! explicit `now` arguments.

use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::debug;

use crate::SessionError;
use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    AwaitingQrScan,
    Connected,
    Disconnected,
    ShuttingDown,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::AwaitingQrScan => "awaiting_qr_scan",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::ShuttingDown => "shutting_down",
        }
    }
}

/// A pairing token and when it was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCode {
    pub code: String,
    pub issued_at: Instant,
    pub issued_at_utc: OffsetDateTime,
}

impl QrCode {
    pub fn is_valid_at(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.issued_at) < ttl
    }

    pub fn remaining_at(&self, now: Instant, ttl: Duration) -> Duration {
        ttl.saturating_sub(now.saturating_duration_since(self.issued_at))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Caller-requested start.
    Initialize,
    QrIssued(QrCode),
    Ready,
    ClientDisconnected { reason: String },
    HealthCheckFailed { detail: String },
    StartFailed { error: String },
    /// The client rejected the stored or scanned credentials.
    AuthFailed { message: String },
    /// A started client produced neither a pairing token nor `Ready` in time.
    StartTimedOut,
    ReconnectDue,
    StartRetryDue,
    /// Intentional teardown; never followed by an automatic reconnect.
    Logout,
    Shutdown,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Initialize => "initialize",
            SessionEvent::QrIssued(_) => "qr_issued",
            SessionEvent::Ready => "ready",
            SessionEvent::ClientDisconnected { .. } => "client_disconnected",
            SessionEvent::HealthCheckFailed { .. } => "health_check_failed",
            SessionEvent::StartFailed { .. } => "start_failed",
            SessionEvent::AuthFailed { .. } => "auth_failed",
            SessionEvent::StartTimedOut => "start_timed_out",
            SessionEvent::ReconnectDue => "reconnect_due",
            SessionEvent::StartRetryDue => "start_retry_due",
            SessionEvent::Logout => "logout",
            SessionEvent::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Destroy any previous client, then create and connect a fresh one.
    StartClient,
    /// Tear the current client down without logging out.
    DestroyClient,
    /// Close the current client with a bounded wait; the process is exiting.
    CloseClient,
    StartMonitor,
    StopMonitor,
    ScheduleReconnect { attempt: u32, delay: Duration },
    ScheduleStartRetry { delay: Duration },
    CancelTimers,
}

#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    qr: Option<QrCode>,
    reconnect_attempts: u32,
    start_retry_used: bool,
    config: SessionConfig,
}

impl SessionMachine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            state: SessionState::Uninitialized,
            qr: None,
            reconnect_attempts: 0,
            start_retry_used: false,
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn qr(&self) -> Option<&QrCode> {
        self.qr.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether the stored token is still usable at `now`; an expired token is dropped.
    pub fn qr_valid_at(&mut self, now: Instant) -> bool {
        let valid = self
            .qr
            .as_ref()
            .is_some_and(|qr| qr.is_valid_at(now, self.config.qr_ttl));
        if !valid && self.qr.take().is_some() {
            debug!("pairing token expired");
        }
        valid
    }

    pub fn apply(&mut self, event: SessionEvent) -> Result<Vec<Effect>, SessionError> {
        use SessionState::*;

        if self.state == ShuttingDown {
            return match event {
                SessionEvent::Initialize => Err(SessionError::ShuttingDown),
                other => {
                    debug!(event = other.name(), "event ignored during shutdown");
                    Ok(Vec::new())
                }
            };
        }

        let effects = match event {
            SessionEvent::Initialize => match self.state {
                Initializing => return Err(SessionError::AlreadyInitializing),
                Connected => {
                    self.set_state(Initializing);
                    self.start_retry_used = false;
                    vec![Effect::StopMonitor, Effect::StartClient]
                }
                _ => {
                    self.set_state(Initializing);
                    self.start_retry_used = false;
                    vec![Effect::CancelTimers, Effect::StartClient]
                }
            },
            SessionEvent::QrIssued(qr) => match self.state {
                Initializing | AwaitingQrScan => {
                    self.set_state(AwaitingQrScan);
                    self.qr = Some(qr);
                    Vec::new()
                }
                state => {
                    debug!(state = state.as_str(), "pairing token ignored");
                    Vec::new()
                }
            },
            SessionEvent::Ready => match self.state {
                Initializing | AwaitingQrScan => {
                    self.set_state(Connected);
                    self.reconnect_attempts = 0;
                    self.start_retry_used = false;
                    vec![Effect::StartMonitor]
                }
                _ => Vec::new(),
            },
            SessionEvent::ClientDisconnected { .. }
            | SessionEvent::HealthCheckFailed { .. }
            | SessionEvent::AuthFailed { .. } => {
                match self.state {
                    Initializing | AwaitingQrScan | Connected => self.enter_disconnected(),
                    _ => Vec::new(),
                }
            }
            SessionEvent::StartFailed { .. } => match self.state {
                Initializing if !self.start_retry_used => {
                    self.start_retry_used = true;
                    self.set_state(Disconnected);
                    vec![
                        Effect::DestroyClient,
                        Effect::ScheduleStartRetry {
                            delay: self.config.start_retry_delay,
                        },
                    ]
                }
                Initializing => self.enter_disconnected(),
                _ => Vec::new(),
            },
            SessionEvent::StartTimedOut => match self.state {
                Initializing => self.enter_disconnected(),
                _ => Vec::new(),
            },
            SessionEvent::ReconnectDue => {
                if self.state == Disconnected
                    && self.reconnect_attempts < self.config.max_reconnect_attempts
                {
                    self.reconnect_attempts += 1;
                    self.set_state(Initializing);
                    vec![Effect::StartClient]
                } else {
                    Vec::new()
                }
            }
            SessionEvent::StartRetryDue => {
                if self.state == Disconnected {
                    self.set_state(Initializing);
                    vec![Effect::StartClient]
                } else {
                    Vec::new()
                }
            }
            SessionEvent::Logout => {
                self.reconnect_attempts = 0;
                self.start_retry_used = false;
                self.set_state(Disconnected);
                vec![Effect::CancelTimers, Effect::StopMonitor, Effect::DestroyClient]
            }
            SessionEvent::Shutdown => {
                self.set_state(ShuttingDown);
                vec![Effect::CancelTimers, Effect::StopMonitor, Effect::CloseClient]
            }
        };
        Ok(effects)
    }

    fn enter_disconnected(&mut self) -> Vec<Effect> {
        let was_connected = self.state == SessionState::Connected;
        self.set_state(SessionState::Disconnected);
        let mut effects = Vec::with_capacity(3);
        if was_connected {
            effects.push(Effect::StopMonitor);
        }
        effects.push(Effect::DestroyClient);
        if self.reconnect_attempts < self.config.max_reconnect_attempts {
            effects.push(Effect::ScheduleReconnect {
                attempt: self.reconnect_attempts + 1,
                delay: self.config.reconnect_delay(self.reconnect_attempts),
            });
        }
        effects
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == SessionState::AwaitingQrScan && next != SessionState::AwaitingQrScan {
            self.qr = None;
        }
        self.state = next;
    }
}
