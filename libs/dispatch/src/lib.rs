//! Send orchestration for the WhatsApp Web gateway.
//!
//! [`SendOrchestrator`] sequences single and bulk sends against the readiness guarantees of a
//! [`wa_session::SessionController`]: every network-touching step is preceded by a health
//! check, recipients are processed strictly in order, and per-recipient failures are captured
//! in a [`wa_core::BulkReport`] instead of aborting the batch.

mod attachment;
mod config;
mod error;
mod orchestrator;

pub use attachment::{Attachment, AttachmentError, AttachmentSource, StagedUploads};
pub use config::DispatchConfig;
pub use error::DispatchError;
pub use orchestrator::{BulkRequest, MediaRequest, SendOrchestrator};
