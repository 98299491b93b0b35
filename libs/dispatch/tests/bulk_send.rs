use std::sync::Arc;
use std::time::Duration;

use wa_core::{
    ClientError, Contact, FailureCode, MediaFraming, OutgoingMessage, SendStatus,
};
use wa_dispatch::{Attachment, BulkRequest, DispatchConfig, DispatchError, SendOrchestrator};
use wa_session::{SessionConfig, SessionController};
use wa_testutil::ScriptedFactory;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn orchestrator(factory: &Arc<ScriptedFactory>) -> SendOrchestrator {
    let session = SessionController::new(SessionConfig::default(), factory.clone());
    session.initialize().await.unwrap();
    settle().await;
    SendOrchestrator::new(session, DispatchConfig::default())
}

fn contacts(mobiles: &[&str]) -> Vec<Contact> {
    mobiles
        .iter()
        .enumerate()
        .map(|(i, mobile)| Contact::with_mobile(*mobile).named(format!("Contact {i}")))
        .collect()
}

fn text_bulk(contacts: Vec<Contact>, template: &str) -> BulkRequest {
    BulkRequest {
        contacts,
        template: Some(template.to_string()),
        ..BulkRequest::default()
    }
}

#[tokio::test]
async fn unregistered_recipients_all_fail_lookup() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    factory.script().register_nobody();
    let orchestrator = orchestrator(&factory).await;

    let request = text_bulk(
        contacts(&["9876543210", "9876543211", "9876543212", "9876543213"]),
        "Hello {{name}}",
    );
    let report = orchestrator.send_bulk(request).await.unwrap();

    assert_eq!((report.total, report.sent, report.failed), (4, 0, 4));
    assert_eq!(report.details.len(), 4);
    for detail in &report.details {
        assert_eq!(detail.status, SendStatus::Failed);
        assert_eq!(detail.code, Some(FailureCode::NotRegistered));
        assert_eq!(detail.reason.as_deref(), Some("Number not registered on WhatsApp"));
    }
    assert!(factory.script().sent().is_empty());
    // unresolved numbers are answered, not retried
    assert_eq!(factory.script().lookups().len(), 4);
}

#[tokio::test]
async fn details_follow_input_order_and_contacts_are_paced() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    factory.script().set_latency(Duration::from_millis(300));
    let orchestrator = orchestrator(&factory).await;

    let mobiles = ["9876543210", "not a phone", "+91 98765 43212", "09876543213"];
    let started = tokio::time::Instant::now();
    let report = orchestrator
        .send_bulk(text_bulk(contacts(&mobiles), "Hi {{name}}"))
        .await
        .unwrap();

    let order: Vec<&str> = report.details.iter().map(|d| d.mobile.as_str()).collect();
    assert_eq!(order, mobiles);
    assert_eq!((report.sent, report.failed), (3, 1));
    assert_eq!(report.details[1].code, Some(FailureCode::InvalidPhoneNumber));
    assert_eq!(report.details[1].reason.as_deref(), Some("Invalid phone number format"));

    let recipients: Vec<String> = factory
        .script()
        .sent()
        .iter()
        .map(|r| r.to.as_str().to_string())
        .collect();
    assert_eq!(
        recipients,
        ["919876543210@c.us", "919876543212@c.us", "919876543213@c.us"]
    );
    assert_eq!(
        factory.script().sent_texts(),
        ["Hi Contact 0", "Hi Contact 2", "Hi Contact 3"]
    );
    // three gaps between four contacts, none after the last
    assert!(started.elapsed() >= Duration::from_millis(7_500));
    assert!(started.elapsed() < Duration::from_millis(10_500));
}

#[tokio::test]
async fn template_and_link_compose_one_message() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let orchestrator = orchestrator(&factory).await;
    let mut asha = Contact::with_mobile("9876543210").named("Asha");
    asha.interested_area = Some("Solar".into());

    let request = BulkRequest {
        contacts: vec![asha],
        template: Some("Hi {{name}}, about {{interestedArea}} {{unknown}}".into()),
        url: Some("https://energenie.example/offer".into()),
        ..BulkRequest::default()
    };
    let report = orchestrator.send_bulk(request).await.unwrap();

    assert!(report.all_sent());
    assert!(report.details[0].has_text && report.details[0].has_url);
    assert_eq!(report.details[0].attachments, None);
    assert_eq!(
        factory.script().sent_texts(),
        ["Hi Asha, about Solar {{unknown}}\n\n🔗 https://energenie.example/offer"]
    );
}

#[tokio::test]
async fn transient_send_error_is_retried_once() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    factory
        .script()
        .fail_sends([ClientError::Operation("Protocol error: Session closed.".into())]);
    let orchestrator = orchestrator(&factory).await;

    let started = tokio::time::Instant::now();
    let report = orchestrator
        .send_bulk(text_bulk(contacts(&["9876543210"]), "ping"))
        .await
        .unwrap();

    assert!(report.all_sent());
    assert_eq!(factory.script().sent_texts(), ["ping"]);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test]
async fn send_failure_is_recorded_and_batch_continues() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    factory
        .script()
        .fail_sends([ClientError::Operation("Chat not found".into())]);
    let orchestrator = orchestrator(&factory).await;

    let report = orchestrator
        .send_bulk(text_bulk(contacts(&["9876543210", "9876543211"]), "ping"))
        .await
        .unwrap();

    assert_eq!((report.sent, report.failed), (1, 1));
    assert_eq!(report.details[0].code, Some(FailureCode::SendFailed));
    assert_eq!(report.details[0].reason.as_deref(), Some("Send error: Chat not found"));
    assert_eq!(report.details[1].status, SendStatus::Sent);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn dead_session_during_lookup_restarts_the_client() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let closed = || ClientError::Operation("Evaluation failed: Session closed".into());
    factory.script().fail_lookups([closed(), closed(), closed()]);
    let orchestrator = orchestrator(&factory).await;

    let report = orchestrator
        .send_bulk(text_bulk(contacts(&["9876543210"]), "after restart"))
        .await
        .unwrap();

    assert!(report.all_sent());
    assert!(logs_contain("restarting client"));
    assert_eq!(factory.created(), 2);
    assert!(factory.clients()[0].is_destroyed());
    let sent = factory.script().sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].client, factory.latest().unwrap().index());
    assert_eq!(factory.script().lookups().len(), 4);
}

#[tokio::test]
async fn lookup_errors_without_restart_count_as_unregistered() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let flaky = || ClientError::Transport("connection reset".into());
    factory.script().fail_lookups([flaky(), flaky(), flaky()]);
    let orchestrator = orchestrator(&factory).await;

    let report = orchestrator
        .send_bulk(text_bulk(contacts(&["9876543210"]), "ping"))
        .await
        .unwrap();

    assert_eq!(report.details[0].code, Some(FailureCode::NotRegistered));
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.script().lookups().len(), 3);
}

#[tokio::test]
async fn attachments_follow_text_and_uploads_are_removed() {
    tokio::time::pause();
    let dir = tempfile::tempdir().unwrap();
    let photo = dir.path().join("attachments-photo.png");
    let brochure = dir.path().join("attachments-brochure.pdf");
    std::fs::write(&photo, b"\x89PNG").unwrap();
    std::fs::write(&brochure, b"%PDF-1.7").unwrap();

    let factory = ScriptedFactory::new();
    let orchestrator = orchestrator(&factory).await;
    let request = BulkRequest {
        contacts: contacts(&["9876543210", "9876543211"]),
        template: Some("Catalogue for {{name}}".into()),
        attachments: vec![
            Attachment::upload(&photo, "image/png", Some("photo.png".into())),
            Attachment::upload(&brochure, "application/pdf", Some("brochure.pdf".into())),
        ],
        ..BulkRequest::default()
    };
    let report = orchestrator.send_bulk(request).await.unwrap();

    assert!(report.all_sent());
    assert_eq!(report.details[0].attachments, Some(2));
    assert!(report.details[0].has_text);
    assert!(!photo.exists());
    assert!(!brochure.exists());

    let sent = factory.script().sent();
    assert_eq!(sent.len(), 6);
    assert!(matches!(&sent[0].message, OutgoingMessage::Text(t) if t == "Catalogue for Contact 0"));
    match (&sent[1].message, &sent[2].message) {
        (
            OutgoingMessage::Media { payload: image, options: image_opts },
            OutgoingMessage::Media { payload: pdf, options: pdf_opts },
        ) => {
            assert_eq!(image.filename.as_deref(), Some("photo.png"));
            assert_eq!(image_opts.framing, MediaFraming::Inline);
            assert_eq!(pdf.mime, "application/pdf");
            assert_eq!(pdf_opts.framing, MediaFraming::Document);
        }
        other => panic!("expected two media messages, got {other:?}"),
    }
    assert_eq!(sent[3].to.as_str(), "919876543211@c.us");
}

#[tokio::test]
async fn missing_attachment_fails_the_contact_not_the_batch() {
    tokio::time::pause();
    let dir = tempfile::tempdir().unwrap();
    let factory = ScriptedFactory::new();
    let orchestrator = orchestrator(&factory).await;

    let request = BulkRequest {
        contacts: contacts(&["9876543210"]),
        attachments: vec![Attachment::upload(
            dir.path().join("vanished.pdf"),
            "application/pdf",
            None,
        )],
        ..BulkRequest::default()
    };
    let report = orchestrator.send_bulk(request).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.details[0].code, Some(FailureCode::Processing));
    assert!(
        report.details[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("Attachment file not found on server")
    );
}

#[tokio::test]
async fn media_bulk_recovers_a_stopped_session() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let session = SessionController::new(SessionConfig::default(), factory.clone());
    let orchestrator = SendOrchestrator::new(session, DispatchConfig::default());

    let request = BulkRequest {
        contacts: contacts(&["9876543210"]),
        attachments: vec![Attachment::memory(&b"GIF89a"[..], "image/gif", None)],
        ..BulkRequest::default()
    };
    let report = orchestrator.send_bulk(request).await.unwrap();

    assert!(report.all_sent());
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn media_bulk_gives_up_when_recovery_fails() {
    tokio::time::pause();
    let dir = tempfile::tempdir().unwrap();
    let upload = dir.path().join("attachments-clip.mp4");
    std::fs::write(&upload, b"mp4").unwrap();

    let factory = ScriptedFactory::new();
    factory.script().fail_connects(10);
    let session = SessionController::new(SessionConfig::default(), factory.clone());
    let orchestrator = SendOrchestrator::new(session, DispatchConfig::default());

    let request = BulkRequest {
        contacts: contacts(&["9876543210"]),
        attachments: vec![Attachment::upload(&upload, "video/mp4", None)],
        ..BulkRequest::default()
    };
    let err = orchestrator.send_bulk(request).await.unwrap_err();

    assert!(matches!(err, DispatchError::NotReady));
    assert!(!upload.exists());
}

#[tokio::test]
async fn text_bulk_requires_a_connected_session() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let session = SessionController::new(SessionConfig::default(), factory.clone());
    let orchestrator = SendOrchestrator::new(session, DispatchConfig::default());

    let err = orchestrator
        .send_bulk(text_bulk(contacts(&["9876543210"]), "ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotReady));
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn empty_requests_are_rejected() {
    tokio::time::pause();
    let factory = ScriptedFactory::new();
    let orchestrator = orchestrator(&factory).await;

    let err = orchestrator
        .send_bulk(BulkRequest {
            template: Some("hi".into()),
            ..BulkRequest::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Contacts array is required");

    let err = orchestrator
        .send_bulk(BulkRequest {
            contacts: contacts(&["9876543210"]),
            template: Some("   ".into()),
            ..BulkRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Validation(_)));
    assert!(err.is_client_error());
}
