//! [`AutomationClient`] backed by an automation sidecar spoken to over JSON/HTTP.
//!
//! The sidecar owns the browser. Each session is addressed as `/sessions/{client_id}`; lifecycle
//! events are long-polled from `/events?after=<seq>` and pumped into the channel returned by
//! [`AutomationClient::connect`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use url::Url;

use crate::client::{
    AutomationClient, ClientError, ClientEvent, ClientFactory, ClientIdentity, ConnectionState,
    MessageId, OutgoingMessage,
};
use crate::phone::RecipientId;

const LONG_POLL_WAIT_SECS: u64 = 25;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_POLL_FAILURES: u32 = 5;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub base_url: Url,
    /// Transient retries for idempotent reads.
    pub max_retries: u8,
    pub poll_failure_backoff: Duration,
}

impl BridgeConfig {
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            max_retries: 2,
            poll_failure_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventBatch {
    #[serde(default)]
    events: Vec<SequencedEvent>,
}

#[derive(Debug, Deserialize)]
struct SequencedEvent {
    seq: u64,
    event: ClientEvent,
}

#[derive(Debug, Deserialize)]
struct StateBody {
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NumberIdBody {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMedia<'a> {
    mimetype: &'a str,
    data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<&'a str>,
}

pub struct HttpBridgeClient {
    http: reqwest::Client,
    config: BridgeConfig,
    identity: ClientIdentity,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl HttpBridgeClient {
    pub fn new(http: reqwest::Client, config: BridgeConfig, identity: ClientIdentity) -> Self {
        Self {
            http,
            config,
            identity,
            pump: Mutex::new(None),
        }
    }

    fn endpoint(&self, suffix: &str) -> Result<Url, ClientError> {
        let path = format!("sessions/{}/{suffix}", self.identity.client_id);
        let path = path.trim_end_matches('/');
        self.config
            .base_url
            .join(path)
            .map_err(|e| ClientError::Transport(format!("invalid bridge url: {e}")))
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| format!("HTTP {status} from bridge: {body}"));
        if status == reqwest::StatusCode::CONFLICT {
            return Err(ClientError::NotConnected);
        }
        Err(ClientError::Operation(message))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let result = match self.execute(request()).await {
                Ok(response) => response
                    .json::<T>()
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string())),
                Err(err) => Err(err),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(ClientError::Transport(msg)) if attempt <= self.config.max_retries => {
                    warn!(attempt, client_id = %self.identity.client_id, error = %msg, "retrying bridge request");
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn spawn_pump(&self, tx: mpsc::UnboundedSender<ClientEvent>) -> Result<JoinHandle<()>, ClientError> {
        let http = self.http.clone();
        let url = self.endpoint("events")?;
        let backoff = self.config.poll_failure_backoff;
        let client_id = self.identity.client_id.clone();
        Ok(tokio::spawn(async move {
            let mut after = 0u64;
            let mut failures = 0u32;
            while !tx.is_closed() {
                let request = http
                    .get(url.clone())
                    .query(&[("after", after), ("wait", LONG_POLL_WAIT_SECS)])
                    .timeout(REQUEST_TIMEOUT + Duration::from_secs(LONG_POLL_WAIT_SECS));
                let batch = match request.send().await {
                    Ok(resp) if resp.status().is_success() => resp.json::<EventBatch>().await.map_err(|e| e.to_string()),
                    Ok(resp) => Err(format!("HTTP {}", resp.status())),
                    Err(err) => Err(err.to_string()),
                };
                match batch {
                    Ok(batch) => {
                        failures = 0;
                        for item in batch.events {
                            after = after.max(item.seq);
                            debug!(%client_id, seq = item.seq, "bridge event");
                            if tx.send(item.event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        if failures >= MAX_POLL_FAILURES {
                            error!(%client_id, error = %err, "bridge event stream lost");
                            let _ = tx.send(ClientEvent::Disconnected {
                                reason: format!("bridge unreachable: {err}"),
                            });
                            return;
                        }
                        warn!(%client_id, failures, error = %err, "event poll failed");
                        tokio::time::sleep(backoff * failures).await;
                    }
                }
            }
        }))
    }

    fn stop_pump(&self) {
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for HttpBridgeClient {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

#[async_trait]
impl AutomationClient for HttpBridgeClient {
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<ClientEvent>, ClientError> {
        let url = self.endpoint("start")?;
        let body = json!({ "dataDir": self.identity.data_dir.to_string_lossy() });
        self.execute(self.http.post(url).json(&body).timeout(REQUEST_TIMEOUT))
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.spawn_pump(tx)?;
        let previous = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(rx)
    }

    async fn state(&self) -> Result<ConnectionState, ClientError> {
        let url = self.endpoint("state")?;
        let body: StateBody = self
            .read_json(|| self.http.get(url.clone()).timeout(REQUEST_TIMEOUT))
            .await?;
        Ok(body
            .state
            .as_deref()
            .map(ConnectionState::parse)
            .unwrap_or(ConnectionState::Disconnected))
    }

    async fn resolve_recipient(
        &self,
        recipient: &RecipientId,
    ) -> Result<Option<RecipientId>, ClientError> {
        let url = self.endpoint("number-id")?;
        let body = json!({ "number": recipient.as_str() });
        let found: NumberIdBody = self
            .read_json(|| self.http.post(url.clone()).json(&body).timeout(REQUEST_TIMEOUT))
            .await?;
        Ok(found.id.filter(|id| !id.is_empty()).map(RecipientId::from_raw))
    }

    async fn send(
        &self,
        recipient: &RecipientId,
        message: &OutgoingMessage,
    ) -> Result<MessageId, ClientError> {
        let url = self.endpoint("messages")?;
        let body = match message {
            OutgoingMessage::Text(text) => json!({
                "to": recipient.as_str(),
                "kind": "text",
                "body": text,
            }),
            OutgoingMessage::Media { payload, options } => json!({
                "to": recipient.as_str(),
                "kind": "media",
                "media": WireMedia {
                    mimetype: &payload.mime,
                    data: STANDARD.encode(&payload.data),
                    filename: payload.filename.as_deref(),
                },
                "options": {
                    "framing": options.framing,
                    "viewOnce": options.view_once,
                    "caption": options.caption,
                    "sticker": options.sticker,
                },
            }),
        };
        let response = self
            .execute(self.http.post(url).json(&body).timeout(REQUEST_TIMEOUT))
            .await?;
        let sent: SentBody = response
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(MessageId(sent.id))
    }

    async fn logout(&self) -> Result<(), ClientError> {
        let url = self.endpoint("logout")?;
        self.execute(self.http.post(url).timeout(REQUEST_TIMEOUT))
            .await
            .map(|_| ())
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        self.stop_pump();
        let url = self.endpoint("")?;
        self.execute(self.http.delete(url).timeout(REQUEST_TIMEOUT))
            .await
            .map(|_| ())
    }
}

/// Creates one [`HttpBridgeClient`] per session start, sharing the HTTP connection pool.
#[derive(Clone)]
pub struct BridgeClientFactory {
    http: reqwest::Client,
    config: BridgeConfig,
}

impl BridgeClientFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

impl ClientFactory for BridgeClientFactory {
    fn create(&self, identity: &ClientIdentity) -> Arc<dyn AutomationClient> {
        Arc::new(HttpBridgeClient::new(
            self.http.clone(),
            self.config.clone(),
            identity.clone(),
        ))
    }
}
