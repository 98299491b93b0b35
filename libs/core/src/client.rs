//! Contract for the underlying browser-automation WhatsApp client.
//!
//! The gateway never talks to WhatsApp directly. It drives an [`AutomationClient`], which
//! reports lifecycle changes through a [`ClientEvent`] stream returned by `connect`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::MediaFraming;
use crate::phone::RecipientId;

/// Default identity used for persisted credentials.
pub const DEFAULT_CLIENT_ID: &str = "energenie-whatsapp";
/// Default credential root directory.
pub const DEFAULT_SESSION_DIR: &str = ".wwebjs_auth";

const TRANSIENT_SIGNATURES: [&str; 4] = [
    "session closed",
    "page has been closed",
    "target closed",
    "protocol error",
];

const RENDERING_SIGNATURES: [&str; 4] = [
    "evaluation failed",
    "processing failed",
    "invalid media",
    "cannot read properties",
];

/// Persistent identity a client binds its credentials to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub data_dir: PathBuf,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            data_dir: PathBuf::from(DEFAULT_SESSION_DIR),
        }
    }
}

impl ClientIdentity {
    /// Directory holding the paired device credentials.
    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join(format!("session-{}", self.client_id))
    }
}

/// Lifecycle notifications emitted by a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Qr { code: String },
    Authenticated,
    AuthFailure { message: String },
    Loading { percent: u8, message: String },
    Ready,
    StateChanged { state: String },
    Disconnected { reason: String },
    MessageReceived { from: String },
}

/// Connection state as reported by the client on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Connecting,
    Disconnected,
    Other(String),
}

impl ConnectionState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CONNECTED" => ConnectionState::Connected,
            "OPENING" | "PAIRING" | "CONNECTING" => ConnectionState::Connecting,
            "" | "DISCONNECTED" | "UNPAIRED" | "UNPAIRED_IDLE" | "CONFLICT" | "UNLAUNCHED" => {
                ConnectionState::Disconnected
            }
            other => ConnectionState::Other(other.to_string()),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Operation(String),
}

impl ClientError {
    fn message_matches(&self, signatures: &[&str]) -> bool {
        let text = self.to_string().to_ascii_lowercase();
        signatures.iter().any(|sig| text.contains(sig))
    }

    /// The browser page or session died underneath the call; a fresh session may succeed.
    pub fn is_transient(&self) -> bool {
        self.message_matches(&TRANSIENT_SIGNATURES)
    }

    /// The client could not render the payload in the requested framing.
    pub fn is_rendering_failure(&self) -> bool {
        self.message_matches(&RENDERING_SIGNATURES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickerMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

/// Raw media bytes plus presentation metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub mime: String,
    pub data: Bytes,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub framing: MediaFraming,
    pub view_once: bool,
    pub caption: Option<String>,
    pub sticker: Option<StickerMeta>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            framing: MediaFraming::Inline,
            view_once: false,
            caption: None,
            sticker: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMessage {
    Text(String),
    Media {
        payload: MediaPayload,
        options: SendOptions,
    },
}

impl OutgoingMessage {
    pub fn text(body: impl Into<String>) -> Self {
        OutgoingMessage::Text(body.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutgoingMessage::Text(_) => "text",
            OutgoingMessage::Media { .. } => "media",
        }
    }
}

/// Identifier the network assigned to a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

#[async_trait]
pub trait AutomationClient: Send + Sync {
    /// Starts the client and returns its lifecycle event stream.
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<ClientEvent>, ClientError>;

    async fn state(&self) -> Result<ConnectionState, ClientError>;

    /// Resolves a normalized id to the network's id, `None` when unregistered.
    async fn resolve_recipient(
        &self,
        recipient: &RecipientId,
    ) -> Result<Option<RecipientId>, ClientError>;

    async fn send(
        &self,
        recipient: &RecipientId,
        message: &OutgoingMessage,
    ) -> Result<MessageId, ClientError>;

    /// Unlinks the device. Persisted credentials become invalid.
    async fn logout(&self) -> Result<(), ClientError>;

    /// Tears down the browser session, keeping credentials.
    async fn destroy(&self) -> Result<(), ClientError>;
}

/// Builds fresh clients bound to an identity.
pub trait ClientFactory: Send + Sync {
    fn create(&self, identity: &ClientIdentity) -> Arc<dyn AutomationClient>;
}

impl<F> ClientFactory for F
where
    F: Fn(&ClientIdentity) -> Arc<dyn AutomationClient> + Send + Sync,
{
    fn create(&self, identity: &ClientIdentity) -> Arc<dyn AutomationClient> {
        self(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_signatures_match_case_insensitively() {
        let err = ClientError::Operation("Protocol error (Runtime.callFunctionOn): Session closed.".into());
        assert!(err.is_transient());
        assert!(ClientError::Transport("Target closed".into()).is_transient());
        assert!(!ClientError::Operation("rate limited".into()).is_transient());
        assert!(!ClientError::NotConnected.is_transient());
    }

    #[test]
    fn rendering_signatures() {
        assert!(ClientError::Operation("Evaluation failed: TypeError".into()).is_rendering_failure());
        assert!(
            ClientError::Operation("Cannot read properties of undefined (reading 'mimetype')".into())
                .is_rendering_failure()
        );
        assert!(!ClientError::Operation("Session closed".into()).is_rendering_failure());
    }

    #[test]
    fn session_path_joins_client_id() {
        let identity = ClientIdentity {
            client_id: "acme".into(),
            data_dir: PathBuf::from("/var/lib/wa"),
        };
        assert_eq!(identity.session_path(), PathBuf::from("/var/lib/wa/session-acme"));
    }

    #[test]
    fn connection_state_parsing() {
        assert_eq!(ConnectionState::parse("CONNECTED"), ConnectionState::Connected);
        assert_eq!(ConnectionState::parse("opening"), ConnectionState::Connecting);
        assert_eq!(ConnectionState::parse("UNPAIRED"), ConnectionState::Disconnected);
        assert_eq!(
            ConnectionState::parse("TIMEOUT"),
            ConnectionState::Other("TIMEOUT".into())
        );
    }

    #[test]
    fn events_use_tagged_json() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"qr","code":"2@abc"}"#).unwrap();
        assert_eq!(event, ClientEvent::Qr { code: "2@abc".into() });
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"disconnected","reason":"LOGOUT"}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::Disconnected {
                reason: "LOGOUT".into()
            }
        );
    }
}
