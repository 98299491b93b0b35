use thiserror::Error;
use wa_core::{ClientError, PhoneRejection};
use wa_session::SessionError;

use crate::attachment::AttachmentError;

/// Request-level failures. Per-recipient failures inside a bulk never surface here.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Validation(String),
    #[error("Invalid phone number format")]
    InvalidRecipient(#[from] PhoneRejection),
    #[error("WhatsApp client is not ready. Please initialize connection first.")]
    NotReady,
    #[error("WhatsApp session is not healthy. Please try again.")]
    Unhealthy,
    #[error("Number {0} is not registered on WhatsApp")]
    RecipientUnreachable(String),
    #[error("Failed to send message: {0}")]
    Send(#[source] ClientError),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl DispatchError {
    pub fn validation(message: impl Into<String>) -> Self {
        DispatchError::Validation(message.into())
    }

    /// Caller mistakes as opposed to server-side failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DispatchError::Validation(_)
                | DispatchError::InvalidRecipient(_)
                | DispatchError::NotReady
                | DispatchError::RecipientUnreachable(_)
        ) || matches!(self, DispatchError::Attachment(err) if err.is_client_error())
    }
}
