use metrics::{counter, histogram};

pub const MESSAGES_SENT: &str = "wa_messages_sent_total";
pub const MESSAGES_FAILED: &str = "wa_messages_failed_total";
pub const BULK_DURATION: &str = "wa_bulk_duration_seconds";
pub const HTTP_REQUESTS: &str = "wa_http_requests_total";

/// One message (text or attachment) accepted by the client.
pub fn record_message_sent(kind: &'static str) {
    counter!(MESSAGES_SENT, "kind" => kind).increment(1);
}

/// One recipient that could not be served, labelled by failure code.
pub fn record_message_failed(code: &'static str) {
    counter!(MESSAGES_FAILED, "code" => code).increment(1);
}

pub fn record_bulk_duration(mode: &'static str, seconds: f64) {
    histogram!(BULK_DURATION, "mode" => mode).record(seconds);
}

/// Labelled by matched route template, not the raw path.
pub fn record_http_request(route: &str, status: u16) {
    counter!(HTTP_REQUESTS, "route" => route.to_owned(), "status" => status.to_string()).increment(1);
}
