use std::sync::Arc;
use std::time::Duration;

use wa_core::{
    ClientError, ConnectionState, Contact, FailureCode, MediaFlags, MediaFraming,
    OutgoingMessage, PhoneRejection, StickerMeta,
};
use wa_dispatch::{Attachment, DispatchConfig, DispatchError, MediaRequest, SendOrchestrator};
use wa_session::{SessionConfig, SessionController};
use wa_testutil::ScriptedFactory;

async fn orchestrator(factory: &Arc<ScriptedFactory>) -> SendOrchestrator {
    let session = SessionController::new(SessionConfig::default(), factory.clone());
    session.initialize().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    SendOrchestrator::new(session, DispatchConfig::default())
}

fn media_request(mobile: &str, attachment: Attachment, flags: MediaFlags) -> MediaRequest {
    MediaRequest {
        contact: Contact::with_mobile(mobile).named("Ravi"),
        caption: None,
        attachment,
        flags,
        sticker: None,
    }
}

fn only_media(factory: &ScriptedFactory) -> (String, wa_core::SendOptions) {
    let sent = factory.script().sent();
    assert_eq!(sent.len(), 1, "expected exactly one message, got {sent:?}");
    match &sent[0].message {
        OutgoingMessage::Media { payload, options } => (payload.mime.clone(), options.clone()),
        other => panic!("expected media, got {other:?}"),
    }
}

#[tokio::test]
async fn single_text_reaches_the_normalized_recipient() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let orchestrator = orchestrator(&factory).await;

    let contact = Contact::with_mobile("098765-43210").named("Asha");
    let result = orchestrator.send_single(&contact, "Namaste").await.unwrap();

    assert!(result.is_sent());
    assert_eq!(result.contact, "Asha");
    let sent = factory.script().sent();
    assert_eq!(sent[0].to.as_str(), "919876543210@c.us");
    assert_eq!(factory.script().sent_texts(), ["Namaste"]);
}

#[tokio::test]
async fn single_text_precondition_errors() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let session = SessionController::new(SessionConfig::default(), factory.clone());
    let idle = SendOrchestrator::new(session, DispatchConfig::default());
    let err = idle
        .send_single(&Contact::with_mobile("9876543210"), "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotReady));
    assert_eq!(
        err.to_string(),
        "WhatsApp client is not ready. Please initialize connection first."
    );

    let factory = ScriptedFactory::new();
    factory.script().register(["919876543210@c.us"]);
    let orchestrator = orchestrator(&factory).await;

    let err = orchestrator
        .send_single(&Contact::with_mobile("9876543210"), "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Validation(_)));

    let err = orchestrator
        .send_single(&Contact::with_mobile("12345"), "hi")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::InvalidRecipient(PhoneRejection::InvalidLength { .. })
    ));

    let err = orchestrator
        .send_single(&Contact::with_mobile("9999999999"), "hi")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Number 9999999999 is not registered on WhatsApp");
    assert!(err.is_client_error());
    assert!(factory.script().sent().is_empty());
}

#[tokio::test]
async fn single_text_send_failure_becomes_a_failed_result() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    factory
        .script()
        .fail_sends([ClientError::Operation("Rate limit hit".into())]);
    let orchestrator = orchestrator(&factory).await;

    let result = orchestrator
        .send_single(&Contact::with_mobile("9876543210"), "hi")
        .await
        .unwrap();
    assert!(!result.is_sent());
    assert_eq!(result.code, Some(FailureCode::SendFailed));
    assert_eq!(result.reason.as_deref(), Some("Send error: Rate limit hit"));
}

#[tokio::test]
async fn unhealthy_session_blocks_single_send() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let orchestrator = orchestrator(&factory).await;
    factory
        .script()
        .set_connection_state(ConnectionState::Other("TIMEOUT".into()));

    let err = orchestrator
        .send_single(&Contact::with_mobile("9876543210"), "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Unhealthy));
    assert!(!err.is_client_error());
}

#[tokio::test]
async fn sticker_flag_frames_images_as_stickers() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let orchestrator = orchestrator(&factory).await;

    let mut request = media_request(
        "9876543210",
        Attachment::memory(&b"RIFFWEBP"[..], "image/webp", Some("logo.webp".into())),
        MediaFlags {
            send_as_sticker: true,
            ..MediaFlags::default()
        },
    );
    request.sticker = Some(StickerMeta {
        name: Some("Energenie".into()),
        author: None,
        categories: vec!["☀️".into()],
    });
    let result = orchestrator.send_media(request).await.unwrap();

    assert!(result.is_sent());
    assert_eq!(result.attachments, Some(1));
    let (mime, options) = only_media(&factory);
    assert_eq!(mime, "image/webp");
    assert_eq!(options.framing, MediaFraming::Sticker);
    assert_eq!(options.sticker.unwrap().name.as_deref(), Some("Energenie"));
}

#[tokio::test]
async fn rejected_framing_falls_back_to_document_once() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    factory.script().fail_sends([ClientError::Operation(
        "Evaluation failed: TypeError: Cannot read properties of undefined".into(),
    )]);
    let orchestrator = orchestrator(&factory).await;

    let mut request = media_request(
        "9876543210",
        Attachment::memory(&b"ogg"[..], "audio/ogg", Some("note.ogg".into())),
        MediaFlags {
            send_as_voice: true,
            ..MediaFlags::default()
        },
    );
    request.caption = Some("  listen  ".into());
    let result = orchestrator.send_media(request).await.unwrap();

    assert!(result.is_sent());
    assert!(result.has_text);
    let (_, options) = only_media(&factory);
    assert_eq!(options.framing, MediaFraming::Document);
    assert_eq!(options.caption.as_deref(), Some("listen"));
}

#[tokio::test]
async fn second_rendering_failure_is_terminal() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let rejected = || ClientError::Operation("Processing failed: invalid media".into());
    factory.script().fail_sends([rejected(), rejected()]);
    let orchestrator = orchestrator(&factory).await;

    let request = media_request(
        "9876543210",
        Attachment::memory(&b"mp4"[..], "video/mp4", None),
        MediaFlags {
            send_as_gif: true,
            is_view_once: true,
            ..MediaFlags::default()
        },
    );
    let result = orchestrator.send_media(request).await.unwrap();

    assert!(!result.is_sent());
    assert_eq!(
        result.reason.as_deref(),
        Some("Send error: Processing failed: invalid media")
    );
    assert!(factory.script().sent().is_empty());
}

#[tokio::test]
async fn view_once_applies_to_inline_images_only() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let orchestrator = orchestrator(&factory).await;
    let flags = MediaFlags {
        is_view_once: true,
        ..MediaFlags::default()
    };

    orchestrator
        .send_media(media_request(
            "9876543210",
            Attachment::memory(&b"jpg"[..], "image/jpeg", None),
            flags,
        ))
        .await
        .unwrap();
    let (_, options) = only_media(&factory);
    assert_eq!(options.framing, MediaFraming::Inline);
    assert!(options.view_once);
}

#[tokio::test]
async fn staged_media_upload_is_removed_after_send() {
    tokio::time::pause();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("file-7c1e.pdf");
    std::fs::write(&file, b"%PDF").unwrap();

    let factory = ScriptedFactory::new();
    factory.script().register_nobody();
    let orchestrator = orchestrator(&factory).await;

    let err = orchestrator
        .send_media(media_request(
            "9876543210",
            Attachment::upload(&file, "application/pdf", Some("quote.pdf".into())),
            MediaFlags::default(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::RecipientUnreachable(_)));
    assert!(!file.exists());
}

#[tokio::test]
async fn recovery_is_a_no_op_when_connected() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let orchestrator = orchestrator(&factory).await;
    let started = tokio::time::Instant::now();
    orchestrator.ensure_ready_or_recover().await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(factory.created(), 1);
}
