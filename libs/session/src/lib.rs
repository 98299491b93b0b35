//! Lifecycle management for the single WhatsApp Web session a gateway process owns.
//!
//! [`machine::SessionMachine`] decides; [`SessionController`] executes: it owns the live
//! automation client, the health monitor and the reconnect timers.
mod config;
mod controller;
pub mod machine;

use thiserror::Error;
use wa_core::ClientError;

pub use config::SessionConfig;
pub use controller::{InitOutcome, QrInfo, QrSnapshot, SessionController, SessionStatus, StatusLabel};
pub use machine::{SessionEvent, SessionMachine, SessionState};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is shutting down")]
    ShuttingDown,
    #[error("session initialization already in progress")]
    AlreadyInitializing,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("failed to remove session data at {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
