use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use serde::Deserialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info, warn};
use wa_core::media::{MAX_UPLOAD_BYTES, MAX_UPLOAD_FILES, media_info};
use wa_core::template::render;
use wa_core::{BulkReport, Contact, MediaFlags, SendResult, StickerMeta, classify};
use wa_dispatch::{Attachment, BulkRequest, DispatchError, MediaRequest, SendOrchestrator};
use wa_session::SessionController;

use crate::cors::CorsPolicy;
use crate::error::ApiError;
use crate::reqid::with_request_id;
use crate::uploads::{UploadForm, UploadStore};

const SERVER_NAME: &str = "Energenie WhatsApp Server";
/// Room for text fields and multipart framing on top of the file bytes.
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;
/// Body ceiling for every route that does not take file uploads.
pub const JSON_BODY_LIMIT: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionController>,
    pub orchestrator: Arc<SendOrchestrator>,
    pub uploads: UploadStore,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<SendOrchestrator>, uploads: UploadStore) -> Self {
        Self {
            session: orchestrator.session().clone(),
            orchestrator,
            uploads,
            started_at: Instant::now(),
        }
    }
}

pub fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

pub fn build_router(state: AppState, cors: &CorsPolicy) -> Router {
    let upload_limit =
        || DefaultBodyLimit::max(MAX_UPLOAD_BYTES * MAX_UPLOAD_FILES + FORM_OVERHEAD_BYTES);
    let api = Router::new()
        .route("/status", get(status))
        .route("/qr", get(qr))
        .route("/initialize", post(initialize))
        .route("/send-single", post(send_single))
        .route("/send-bulk", post(send_bulk))
        .route(
            "/send-single-media",
            post(send_single_media).layer(upload_limit()),
        )
        .route("/send-sticker", post(send_sticker).layer(upload_limit()))
        .route("/send-media-url", post(send_media_url))
        .route(
            "/send-bulk-multimedia",
            post(send_bulk_multimedia).layer(upload_limit()),
        )
        .route("/disconnect", post(disconnect))
        .route("/clear-session", post(clear_session))
        .route("/media-info", get(media_info_handler));

    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(api_health))
        .nest("/api/whatsapp", api)
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT))
        .layer(middleware::from_fn(with_request_id))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors.layer())
        .with_state(state)
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "handler panicked");
    ApiError::internal("Internal server error").into_response()
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ApiError::PayloadTooLarge(rejection.body_text())
            } else {
                ApiError::bad_request(rejection.body_text())
            }
        })
}

fn require_ready(session: &SessionController) -> Result<(), ApiError> {
    if session.ready_client().is_some() {
        Ok(())
    } else {
        Err(ApiError::NotReady)
    }
}

/// Maps orchestrator errors for single-recipient endpoints, naming the submitted number.
fn single_error(contact: &Contact, err: DispatchError) -> ApiError {
    match err {
        DispatchError::InvalidRecipient(_) => {
            ApiError::bad_request(format!("Invalid phone number format: {}", contact.mobile))
        }
        other => other.into(),
    }
}

/// A failed result from a single send becomes a 500 carrying the client's reason.
fn single_response(result: SendResult, message: &str) -> Result<Json<Value>, ApiError> {
    if !result.is_sent() {
        let reason = result.reason.unwrap_or_default();
        let reason = reason.strip_prefix("Send error: ").unwrap_or(&reason);
        return Err(ApiError::SendFailed(reason.to_string()));
    }
    let contact = if result.contact == result.mobile {
        "Unknown".to_string()
    } else {
        result.contact
    };
    Ok(Json(json!({
        "success": true,
        "message": message,
        "contact": contact,
        "mobile": result.mobile,
        "timestamp": timestamp(),
    })))
}

fn bulk_response(report: BulkReport, message: String, partial_status: StatusCode) -> Response {
    let status = if report.all_sent() {
        StatusCode::OK
    } else {
        partial_status
    };
    let body = Json(json!({
        "success": report.all_sent(),
        "message": message,
        "results": report,
        "timestamp": timestamp(),
    }));
    (status, body).into_response()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": timestamp(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn api_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "server": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": timestamp(),
        "whatsapp": {
            "connected": state.session.ready_client().is_some(),
            "hasQR": state.session.is_qr_valid(),
        },
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let status = state.session.status();
    Json(json!({
        "status": status.status,
        "state": status.state,
        "qrCode": status.qr_code,
        "reconnectAttempts": status.reconnect_attempts,
        "monitorActive": status.monitor_active,
        "timestamp": timestamp(),
    }))
}

async fn qr(State(state): State<AppState>) -> Json<Value> {
    match state.session.qr() {
        Some(snapshot) => Json(json!({
            "success": true,
            "qrCode": snapshot.code,
            "message": "Scan this QR code with WhatsApp on your phone",
            "expiresIn": snapshot.expires_in,
            "generatedAt": snapshot.generated_at,
        })),
        None => Json(json!({
            "success": false,
            "message": "QR code not available or expired. Initialize WhatsApp or wait for new QR code.",
            "timestamp": timestamp(),
        })),
    }
}

/// Kicks off a session start and answers without waiting for it.
async fn initialize(State(state): State<AppState>) -> Json<Value> {
    let session = state.session.clone();
    tokio::spawn(async move {
        match session.initialize().await {
            Ok(outcome) => info!(?outcome, "initialization requested over http"),
            Err(err) => warn!(error = %err, "initialization rejected"),
        }
    });
    Json(json!({
        "success": true,
        "message": "WhatsApp initialization started",
        "timestamp": timestamp(),
    }))
}

#[derive(Debug, Deserialize)]
struct SendSingleBody {
    contact: Option<Contact>,
    message: Option<String>,
}

async fn send_single(
    State(state): State<AppState>,
    payload: Result<Json<SendSingleBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    require_ready(&state.session)?;
    let body = json_body(payload)?;
    let (Some(contact), Some(message)) = (
        body.contact.filter(|c| !c.mobile.trim().is_empty()),
        body.message.filter(|m| !m.trim().is_empty()),
    ) else {
        return Err(ApiError::bad_request(
            "Contact mobile number and message are required",
        ));
    };
    let message = render(&message, &contact);
    let result = state
        .orchestrator
        .send_single(&contact, &message)
        .await
        .map_err(|err| single_error(&contact, err))?;
    single_response(result, "Message sent successfully")
}

#[derive(Debug, Deserialize)]
struct SendBulkBody {
    contacts: Option<Vec<Contact>>,
    template: Option<String>,
    url: Option<String>,
}

async fn send_bulk(
    State(state): State<AppState>,
    payload: Result<Json<SendBulkBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    require_ready(&state.session)?;
    let body = json_body(payload)?;
    let contacts = body.contacts.filter(|c| !c.is_empty()).ok_or_else(|| {
        ApiError::bad_request("Contacts array is required")
    })?;
    let blank = |v: &Option<String>| v.as_deref().is_none_or(|v| v.trim().is_empty());
    if blank(&body.template) && blank(&body.url) {
        return Err(ApiError::bad_request("Message template or URL is required"));
    }

    let report = state
        .orchestrator
        .send_bulk(BulkRequest {
            contacts,
            template: body.template,
            url: body.url,
            ..BulkRequest::default()
        })
        .await?;
    let message = format!(
        "Successfully sent {} messages! Failed: {}",
        report.sent, report.failed
    );
    Ok(bulk_response(report, message, StatusCode::OK))
}

fn form_flags(form: &UploadForm) -> MediaFlags {
    MediaFlags {
        send_as_document: form.flag("sendAsDocument"),
        send_as_sticker: form.flag("sendAsSticker"),
        send_as_voice: form.flag("sendAsVoice"),
        send_as_gif: form.flag("sendAsGif"),
        is_view_once: form.flag("isViewOnce"),
    }
}

fn form_contact(form: &UploadForm) -> Result<Contact, ApiError> {
    if let Some(raw) = form.field("contact") {
        let contact: Contact = serde_json::from_str(raw)
            .map_err(|err| ApiError::bad_request(format!("Invalid contact: {err}")))?;
        if !contact.mobile.trim().is_empty() {
            return Ok(contact);
        }
    }
    let mobile = form
        .field("mobile")
        .ok_or_else(|| ApiError::bad_request("Contact mobile number is required"))?;
    let mut contact = Contact::with_mobile(mobile.trim());
    contact.name = form.field("name").map(str::to_string);
    Ok(contact)
}

fn single_attachment(form: &mut UploadForm) -> Result<Attachment, ApiError> {
    let mut attachments = form.take_attachments();
    if attachments.len() > 1 {
        return Err(ApiError::bad_request("Only one media file is accepted"));
    }
    attachments
        .pop()
        .ok_or_else(|| ApiError::bad_request("Media file is required"))
}

async fn send_media(
    state: &AppState,
    request: MediaRequest,
) -> Result<Json<Value>, ApiError> {
    let contact = request.contact.clone();
    let result = state
        .orchestrator
        .send_media(request)
        .await
        .map_err(|err| single_error(&contact, err))?;
    single_response(result, "Media sent successfully")
}

async fn send_single_media(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    require_ready(&state.session)?;
    let mut form = UploadForm::read(&state.uploads, multipart).await?;
    let contact = form_contact(&form)?;
    let attachment = single_attachment(&mut form)?;
    let caption = form
        .field("caption")
        .or_else(|| form.field("message"))
        .map(|caption| render(caption, &contact));
    let flags = form_flags(&form);
    send_media(
        &state,
        MediaRequest {
            contact,
            caption,
            attachment,
            flags,
            sticker: None,
        },
    )
    .await
}

async fn send_sticker(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    require_ready(&state.session)?;
    let mut form = UploadForm::read(&state.uploads, multipart).await?;
    let contact = form_contact(&form)?;
    let attachment = single_attachment(&mut form)?;
    if !attachment.capabilities().sticker {
        return Err(ApiError::bad_request("Sticker must be an image"));
    }
    let sticker = StickerMeta {
        name: form.field("stickerName").map(str::to_string),
        author: form.field("stickerAuthor").map(str::to_string),
        categories: form
            .field("stickerCategories")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };
    send_media(
        &state,
        MediaRequest {
            contact,
            caption: None,
            attachment,
            flags: MediaFlags {
                send_as_sticker: true,
                ..MediaFlags::default()
            },
            sticker: Some(sticker),
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMediaUrlBody {
    contact: Option<Contact>,
    mobile: Option<String>,
    name: Option<String>,
    url: Option<String>,
    caption: Option<String>,
    filename: Option<String>,
    #[serde(flatten)]
    flags: MediaFlags,
}

async fn send_media_url(
    State(state): State<AppState>,
    payload: Result<Json<SendMediaUrlBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    require_ready(&state.session)?;
    let body = json_body(payload)?;
    let contact = match (body.contact, body.mobile) {
        (Some(contact), _) if !contact.mobile.trim().is_empty() => contact,
        (_, Some(mobile)) if !mobile.trim().is_empty() => {
            let mut contact = Contact::with_mobile(mobile.trim());
            contact.name = body.name;
            contact
        }
        _ => return Err(ApiError::bad_request("Contact mobile number is required")),
    };
    let url = body
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Media URL is required"))?;
    let mut attachment =
        Attachment::remote(&url).map_err(|err| ApiError::bad_request(err.to_string()))?;
    if let Some(filename) = body.filename.filter(|f| !f.trim().is_empty()) {
        attachment = attachment.with_filename(filename);
    }
    let caption = body.caption.map(|caption| render(&caption, &contact));
    send_media(
        &state,
        MediaRequest {
            contact,
            caption,
            attachment,
            flags: body.flags,
            sticker: None,
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
struct BulkMultimediaData {
    #[serde(default)]
    contacts: Vec<Contact>,
    template: Option<String>,
    url: Option<String>,
    #[serde(flatten)]
    flags: MediaFlags,
}

async fn send_bulk_multimedia(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut form = UploadForm::read(&state.uploads, multipart).await?;
    let raw = form
        .field("data")
        .ok_or_else(|| ApiError::bad_request("Bulk data is required"))?;
    let data: BulkMultimediaData = serde_json::from_str(raw)
        .map_err(|err| ApiError::bad_request(format!("Invalid bulk data: {err}")))?;
    let attachments = form.take_attachments();
    info!(
        contacts = data.contacts.len(),
        attachments = attachments.len(),
        "multimedia bulk request received"
    );
    for attachment in &attachments {
        let caps = classify(&attachment.content_type);
        tracing::debug!(content_type = %attachment.content_type, ?caps, "attachment accepted");
    }

    let report = state
        .orchestrator
        .send_bulk(BulkRequest {
            contacts: data.contacts,
            template: data.template,
            url: data.url,
            attachments,
            flags: data.flags,
        })
        .await?;
    let message = format!("Sent: {}, Failed: {}", report.sent, report.failed);
    Ok(bulk_response(report, message, StatusCode::MULTI_STATUS))
}

async fn disconnect(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state
        .session
        .disconnect()
        .await
        .map_err(|err| ApiError::internal(format!("Failed to disconnect WhatsApp: {err}")))?;
    Ok(Json(json!({
        "success": true,
        "message": "WhatsApp disconnected successfully",
        "timestamp": timestamp(),
    })))
}

async fn clear_session(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state
        .session
        .clear_session()
        .await
        .map_err(|err| ApiError::internal(format!("Failed to clear session: {err}")))?;
    Ok(Json(json!({
        "success": true,
        "message": "WhatsApp session cleared. Initialize to pair a new device.",
        "timestamp": timestamp(),
    })))
}

async fn media_info_handler() -> Json<Value> {
    Json(json!({
        "success": true,
        "mediaInfo": media_info(),
    }))
}
