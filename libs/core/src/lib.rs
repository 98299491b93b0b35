//! Core contracts and value types for the WhatsApp Web gateway.
//!
//! This crate holds the pure pieces (phone normalization, template rendering, media
//! classification) together with the [`AutomationClient`] contract every session driver and
//! sender is written against, and an HTTP bridge implementation of it.
pub mod bridge;
pub mod client;
pub mod media;
pub mod phone;
pub mod retry;
pub mod template;
pub mod types;

pub use bridge::{BridgeClientFactory, BridgeConfig, HttpBridgeClient};
pub use client::{
    AutomationClient, ClientError, ClientEvent, ClientFactory, ClientIdentity, ConnectionState,
    MediaPayload, MessageId, OutgoingMessage, SendOptions, StickerMeta,
};
pub use media::{MediaCapabilities, MediaFlags, MediaFraming, classify};
pub use phone::{PhoneRejection, PhoneRules, RecipientId};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use types::*;
