use std::sync::Arc;

use tokio::sync::OnceCell;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use wa_core::media::{FramingPlan, MediaFraming, plan_framing};
use wa_core::template::{compose_message, render};
use wa_core::{
    AutomationClient, BulkReport, ClientError, Contact, FailureReason, MediaFlags, MediaPayload,
    MessageId, OutgoingMessage, PhoneRules, RecipientId, SendOptions, SendResult, StickerMeta,
    classify, retry_with_backoff,
};
use wa_session::SessionController;
use wa_telemetry::{record_bulk_duration, record_message_failed, record_message_sent};

use crate::attachment::{Attachment, StagedUploads};
use crate::config::DispatchConfig;
use crate::error::DispatchError;

/// One message (template, link and attachments) fanned out to many contacts.
#[derive(Debug, Clone, Default)]
pub struct BulkRequest {
    pub contacts: Vec<Contact>,
    pub template: Option<String>,
    pub url: Option<String>,
    pub attachments: Vec<Attachment>,
    pub flags: MediaFlags,
}

/// One attachment to one contact.
#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub contact: Contact,
    pub caption: Option<String>,
    pub attachment: Attachment,
    pub flags: MediaFlags,
    pub sticker: Option<StickerMeta>,
}

struct BulkJob<'a> {
    template: Option<&'a str>,
    url: Option<&'a str>,
    attachments: &'a [Attachment],
    payloads: Vec<OnceCell<MediaPayload>>,
    flags: MediaFlags,
}

pub struct SendOrchestrator {
    session: Arc<SessionController>,
    config: DispatchConfig,
    rules: PhoneRules,
    http: reqwest::Client,
}

impl SendOrchestrator {
    pub fn new(session: Arc<SessionController>, config: DispatchConfig) -> Self {
        Self {
            session,
            config,
            rules: PhoneRules::default(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_phone_rules(mut self, rules: PhoneRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn session(&self) -> &Arc<SessionController> {
        &self.session
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Sends one text message.
    ///
    /// Precondition failures (not connected, bad number, unregistered recipient, unhealthy
    /// session) are returned as errors. A failure of the send itself is reported as a failed
    /// [`SendResult`] carrying the client's message.
    pub async fn send_single(
        &self,
        contact: &Contact,
        message: &str,
    ) -> Result<SendResult, DispatchError> {
        if self.session.ready_client().is_none() {
            return Err(DispatchError::NotReady);
        }
        if contact.mobile.trim().is_empty() || message.trim().is_empty() {
            return Err(DispatchError::validation(
                "Mobile number and message are required",
            ));
        }
        let to = self.rules.normalize(&contact.mobile)?;
        let to = self.resolve_once(contact, &to).await?;
        if !self.wait_ready().await {
            return Err(DispatchError::Unhealthy);
        }
        let client = self.session.ready_client().ok_or(DispatchError::Unhealthy)?;

        match client.send(&to, &OutgoingMessage::text(message)).await {
            Ok(id) => {
                record_message_sent("text");
                info!(recipient = %to, message_id = %id.0, "message sent");
                Ok(SendResult::sent(contact))
            }
            Err(err) => Ok(self.failure(contact, FailureReason::SendFailed(err.to_string()))),
        }
    }

    /// Sends one attachment, optionally captioned, with framing chosen from its content type
    /// and the caller's flags.
    pub async fn send_media(&self, request: MediaRequest) -> Result<SendResult, DispatchError> {
        let _staged = StagedUploads::for_attachments([&request.attachment]);
        let contact = &request.contact;
        if self.session.ready_client().is_none() {
            return Err(DispatchError::NotReady);
        }
        if contact.mobile.trim().is_empty() {
            return Err(DispatchError::validation("Mobile number is required"));
        }
        let to = self.rules.normalize(&contact.mobile)?;
        let to = self.resolve_once(contact, &to).await?;
        let payload = request
            .attachment
            .load(&self.http, self.config.fetch_timeout)
            .await?;
        if !self.wait_ready().await {
            return Err(DispatchError::Unhealthy);
        }

        let caption = request
            .caption
            .as_deref()
            .map(str::trim)
            .filter(|caption| !caption.is_empty());
        let plan = plan_framing(classify(&payload.mime), request.flags);
        debug!(recipient = %to, mime = %payload.mime, framing = ?plan.framing, view_once = plan.view_once, "sending media");

        match self
            .deliver_media(&to, &payload, plan, caption, request.sticker.as_ref())
            .await
        {
            Ok(_) => Ok(SendResult::sent(contact).with_content(Some(1), caption.is_some(), false)),
            Err(err) => Ok(self.failure(contact, FailureReason::SendFailed(err.to_string()))),
        }
    }

    /// Sends the composed text and then each attachment to every contact, strictly in order.
    ///
    /// Per-contact failures are recorded in the report and never abort the batch. Staged
    /// uploads are removed when this returns, on every path.
    pub async fn send_bulk(&self, request: BulkRequest) -> Result<BulkReport, DispatchError> {
        let _staged = StagedUploads::for_attachments(&request.attachments);
        if request.contacts.is_empty() {
            return Err(DispatchError::validation("Contacts array is required"));
        }
        let template = non_blank(request.template.as_deref());
        let url = non_blank(request.url.as_deref());
        if template.is_none() && url.is_none() && request.attachments.is_empty() {
            return Err(DispatchError::validation(
                "Message template, attachments, or URL is required",
            ));
        }

        let mode = if request.attachments.is_empty() {
            if self.session.ready_client().is_none() {
                return Err(DispatchError::NotReady);
            }
            "text"
        } else {
            self.ensure_ready_or_recover().await?;
            "multimedia"
        };

        let job = BulkJob {
            template,
            url,
            attachments: &request.attachments,
            payloads: request.attachments.iter().map(|_| OnceCell::new()).collect(),
            flags: request.flags,
        };
        let total = request.contacts.len();
        let started = Instant::now();
        info!(contacts = total, attachments = job.attachments.len(), mode, "starting bulk send");

        let mut report = BulkReport::new(total);
        for (index, contact) in request.contacts.iter().enumerate() {
            debug!(position = index + 1, total, contact = contact.display_name(), "processing contact");
            let result = self.send_to_contact(contact, &job).await;
            report.record(result);
            if index + 1 < total {
                sleep(self.config.contact_gap).await;
            }
        }

        record_bulk_duration(mode, started.elapsed().as_secs_f64());
        info!(sent = report.sent, failed = report.failed, mode, "bulk send complete");
        Ok(report)
    }

    /// Returns once the session is connected, restarting it once if polling alone does not help.
    pub async fn ensure_ready_or_recover(&self) -> Result<(), DispatchError> {
        if self.session.ready_client().is_some() {
            return Ok(());
        }
        warn!("session not ready, attempting recovery");
        if self.recovery_poll().await {
            return Ok(());
        }
        match self.session.initialize().await {
            Ok(outcome) => info!(?outcome, "session restart requested"),
            Err(err) => warn!(error = %err, "session restart failed"),
        }
        sleep(self.config.recovery_settle).await;
        if self.recovery_poll().await {
            Ok(())
        } else {
            Err(DispatchError::NotReady)
        }
    }

    async fn recovery_poll(&self) -> bool {
        self.session
            .wait_for_ready(self.config.recovery_checks, self.config.ready_delay)
            .await
    }

    async fn wait_ready(&self) -> bool {
        self.session
            .wait_for_ready(self.config.ready_checks, self.config.ready_delay)
            .await
    }

    async fn send_to_contact(&self, contact: &Contact, job: &BulkJob<'_>) -> SendResult {
        let to = match self.rules.normalize(&contact.mobile) {
            Ok(to) => to,
            Err(rejection) => {
                warn!(contact = contact.display_name(), mobile = %contact.mobile, %rejection, "invalid phone number");
                return self.failure(contact, FailureReason::InvalidPhoneNumber(rejection));
            }
        };
        let rendered = job.template.map(|template| render(template, contact));
        let text = compose_message(rendered.as_deref(), job.url);

        if !self.wait_ready().await {
            return self.failure(contact, FailureReason::SessionNotReady);
        }
        let Some(to) = self.lookup(&to).await else {
            return self.failure(contact, FailureReason::NotRegistered);
        };

        if let Some(text) = &text {
            let message = OutgoingMessage::text(text.as_str());
            if let Err(reason) = self.send_with_retry(&to, &message).await {
                return self.failure(contact, reason);
            }
            if !job.attachments.is_empty() {
                sleep(self.config.text_settle).await;
            }
        }

        for (index, (attachment, cell)) in job.attachments.iter().zip(&job.payloads).enumerate() {
            let payload = match cell
                .get_or_try_init(|| attachment.load(&self.http, self.config.fetch_timeout))
                .await
            {
                Ok(payload) => payload,
                Err(err) => {
                    return self.failure(contact, FailureReason::Processing(err.to_string()));
                }
            };
            if let Err(reason) = self.send_attachment(&to, payload, job.flags).await {
                return self.failure(contact, reason);
            }
            debug!(recipient = %to, attachment = index + 1, "attachment sent");
            if index + 1 < job.attachments.len() {
                sleep(self.config.attachment_gap).await;
            }
        }

        let attachments = (!job.attachments.is_empty()).then_some(job.attachments.len());
        info!(recipient = %to, contact = contact.display_name(), "contact served");
        SendResult::sent(contact).with_content(attachments, job.template.is_some(), job.url.is_some())
    }

    async fn resolve_once(
        &self,
        contact: &Contact,
        to: &RecipientId,
    ) -> Result<RecipientId, DispatchError> {
        let client = self.session.ready_client().ok_or(DispatchError::NotReady)?;
        match client.resolve_recipient(to).await {
            Ok(Some(resolved)) => Ok(resolved),
            Ok(None) => Err(DispatchError::RecipientUnreachable(contact.mobile.clone())),
            Err(err) => Err(DispatchError::Send(err)),
        }
    }

    async fn resolve(&self, to: &RecipientId) -> Result<Option<RecipientId>, ClientError> {
        if !self.wait_ready().await {
            return Err(ClientError::Operation(
                "Session not ready after health check".into(),
            ));
        }
        let client = self.session.ready_client().ok_or(ClientError::NotConnected)?;
        client.resolve_recipient(to).await
    }

    /// `None` when the number is unregistered or every lookup failed.
    async fn lookup(&self, to: &RecipientId) -> Option<RecipientId> {
        let outcome = retry_with_backoff(
            self.config.lookup,
            |_| true,
            |attempt| async move {
                debug!(recipient = %to, attempt, "checking registration");
                self.resolve(to).await
            },
        )
        .await;
        match outcome {
            Ok(found) => found,
            Err(err) if err.is_transient() => self.lookup_after_restart(to).await,
            Err(err) => {
                warn!(recipient = %to, error = %err, "recipient lookup failed");
                None
            }
        }
    }

    async fn lookup_after_restart(&self, to: &RecipientId) -> Option<RecipientId> {
        warn!(recipient = %to, "session closed during lookup, restarting client");
        if let Err(err) = self.session.initialize().await {
            warn!(error = %err, "session restart failed");
            return None;
        }
        sleep(self.config.reinit_settle).await;
        match self.resolve(to).await {
            Ok(found) => found,
            Err(err) => {
                warn!(recipient = %to, error = %err, "lookup after restart failed");
                None
            }
        }
    }

    async fn send_with_retry(
        &self,
        to: &RecipientId,
        message: &OutgoingMessage,
    ) -> Result<MessageId, FailureReason> {
        retry_with_backoff(self.config.send, ClientError::is_transient, |_| async move {
            let client = self.client_for_send().await?;
            let id = client.send(to, message).await?;
            record_message_sent(message.kind());
            Ok::<_, ClientError>(id)
        })
        .await
        .map_err(|err| FailureReason::SendFailed(err.to_string()))
    }

    async fn send_attachment(
        &self,
        to: &RecipientId,
        payload: &MediaPayload,
        flags: MediaFlags,
    ) -> Result<MessageId, FailureReason> {
        let plan = plan_framing(classify(&payload.mime), flags);
        retry_with_backoff(self.config.send, ClientError::is_transient, |_| async move {
            self.client_for_send().await?;
            self.deliver_media(to, payload, plan, None, None).await
        })
        .await
        .map_err(|err| FailureReason::SendFailed(err.to_string()))
    }

    async fn client_for_send(
        &self,
    ) -> Result<Arc<dyn AutomationClient>, ClientError> {
        if !self.wait_ready().await {
            return Err(ClientError::Operation(
                "Session not ready for sending message".into(),
            ));
        }
        self.session.ready_client().ok_or(ClientError::NotConnected)
    }

    /// Sends with the planned framing, falling back once to a plain document when the client
    /// cannot render the payload that way.
    async fn deliver_media(
        &self,
        to: &RecipientId,
        payload: &MediaPayload,
        plan: FramingPlan,
        caption: Option<&str>,
        sticker: Option<&StickerMeta>,
    ) -> Result<MessageId, ClientError> {
        let client = self.session.ready_client().ok_or(ClientError::NotConnected)?;
        let message = media_message(payload, plan, caption, sticker);
        let id = match client.send(to, &message).await {
            Ok(id) => id,
            Err(err) if err.is_rendering_failure() && plan != FramingPlan::DOCUMENT => {
                warn!(recipient = %to, framing = ?plan.framing, error = %err, "framing rejected, resending as document");
                let fallback = media_message(payload, FramingPlan::DOCUMENT, caption, None);
                client.send(to, &fallback).await?
            }
            Err(err) => return Err(err),
        };
        record_message_sent("media");
        Ok(id)
    }

    fn failure(&self, contact: &Contact, reason: FailureReason) -> SendResult {
        warn!(contact = contact.display_name(), mobile = %contact.mobile, code = reason.code().as_str(), %reason, "recipient failed");
        record_message_failed(reason.code().as_str());
        SendResult::failed(contact, reason)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn media_message(
    payload: &MediaPayload,
    plan: FramingPlan,
    caption: Option<&str>,
    sticker: Option<&StickerMeta>,
) -> OutgoingMessage {
    let sticker = match plan.framing {
        MediaFraming::Sticker => sticker.cloned(),
        _ => None,
    };
    OutgoingMessage::Media {
        payload: payload.clone(),
        options: SendOptions {
            framing: plan.framing,
            view_once: plan.view_once,
            caption: caption.map(str::to_string),
            sticker,
        },
    }
}
