//! Scripted [`AutomationClient`] for tests.
//!
//! All clients created by one [`ScriptedFactory`] share a [`Script`], so behaviour configured
//! before a session restart still applies to the replacement client.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use wa_core::{
    AutomationClient, ClientError, ClientEvent, ClientFactory, ClientIdentity, ConnectionState,
    MessageId, OutgoingMessage, RecipientId,
};

/// A message accepted by a scripted client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub client: usize,
    pub to: RecipientId,
    pub message: OutgoingMessage,
}

#[derive(Debug)]
struct ScriptState {
    register_all: bool,
    registered: HashSet<String>,
    lookup_failures: VecDeque<ClientError>,
    send_failures: VecDeque<ClientError>,
    connect_failures: u32,
    latency: Duration,
    state: ConnectionState,
    auto_ready: bool,
    auto_qr: Option<String>,
    sent: Vec<SentRecord>,
    lookups: Vec<RecipientId>,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            register_all: true,
            registered: HashSet::new(),
            lookup_failures: VecDeque::new(),
            send_failures: VecDeque::new(),
            connect_failures: 0,
            latency: Duration::ZERO,
            state: ConnectionState::Connected,
            auto_ready: true,
            auto_qr: None,
            sent: Vec::new(),
            lookups: Vec::new(),
        }
    }
}

/// Shared behaviour for scripted clients.
#[derive(Debug, Default)]
pub struct Script {
    state: Mutex<ScriptState>,
}

impl Script {
    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restricts lookups to the given normalized ids.
    pub fn register<I, S>(&self, ids: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.lock();
        state.register_all = false;
        state.registered.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn register_nobody(&self) -> &Self {
        let mut state = self.lock();
        state.register_all = false;
        state.registered.clear();
        self
    }

    /// Queues errors returned by the next lookups, in order.
    pub fn fail_lookups<I: IntoIterator<Item = ClientError>>(&self, errors: I) -> &Self {
        self.lock().lookup_failures.extend(errors);
        self
    }

    /// Queues errors returned by the next sends, in order.
    pub fn fail_sends<I: IntoIterator<Item = ClientError>>(&self, errors: I) -> &Self {
        self.lock().send_failures.extend(errors);
        self
    }

    pub fn fail_connects(&self, count: u32) -> &Self {
        self.lock().connect_failures = count;
        self
    }

    pub fn set_latency(&self, latency: Duration) -> &Self {
        self.lock().latency = latency;
        self
    }

    pub fn set_connection_state(&self, state: ConnectionState) -> &Self {
        self.lock().state = state;
        self
    }

    /// When set, `connect` emits `Ready` immediately.
    pub fn auto_ready(&self, enabled: bool) -> &Self {
        self.lock().auto_ready = enabled;
        self
    }

    /// When set, `connect` emits a QR token before anything else.
    pub fn auto_qr(&self, code: Option<&str>) -> &Self {
        self.lock().auto_qr = code.map(str::to_string);
        self
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.lock().sent.clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.lock()
            .sent
            .iter()
            .filter_map(|r| match &r.message {
                OutgoingMessage::Text(text) => Some(text.clone()),
                OutgoingMessage::Media { .. } => None,
            })
            .collect()
    }

    pub fn lookups(&self) -> Vec<RecipientId> {
        self.lock().lookups.clone()
    }

    fn latency(&self) -> Duration {
        self.lock().latency
    }
}

/// In-process client whose behaviour comes from a shared [`Script`].
#[derive(Debug)]
pub struct ScriptedClient {
    index: usize,
    script: Arc<Script>,
    events: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    connects: AtomicU32,
    destroys: AtomicU32,
    logged_out: AtomicBool,
}

impl ScriptedClient {
    pub fn new(index: usize, script: Arc<Script>) -> Self {
        Self {
            index,
            script,
            events: Mutex::new(None),
            connects: AtomicU32::new(0),
            destroys: AtomicU32::new(0),
            logged_out: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Pushes an event to the session driver. Returns false when nobody listens.
    pub fn emit(&self, event: ClientEvent) -> bool {
        let guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> u32 {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroys() > 0
    }

    pub fn logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let latency = self.script.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl AutomationClient for ScriptedClient {
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<ClientEvent>, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let (auto_qr, auto_ready) = {
            let mut state = self.script.lock();
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(ClientError::Operation("Failed to launch the browser process".into()));
            }
            (state.auto_qr.clone(), state.auto_ready)
        };
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(code) = auto_qr {
            let _ = tx.send(ClientEvent::Qr { code });
        }
        if auto_ready {
            let _ = tx.send(ClientEvent::Authenticated);
            let _ = tx.send(ClientEvent::Ready);
        }
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        tracing::debug!(client = self.index, "scripted client connected");
        Ok(rx)
    }

    async fn state(&self) -> Result<ConnectionState, ClientError> {
        if self.is_destroyed() {
            return Err(ClientError::Operation("Session closed".into()));
        }
        Ok(self.script.lock().state.clone())
    }

    async fn resolve_recipient(
        &self,
        recipient: &RecipientId,
    ) -> Result<Option<RecipientId>, ClientError> {
        self.pause().await;
        let mut state = self.script.lock();
        state.lookups.push(recipient.clone());
        if let Some(err) = state.lookup_failures.pop_front() {
            return Err(err);
        }
        let known = state.register_all || state.registered.contains(recipient.as_str());
        Ok(known.then(|| recipient.clone()))
    }

    async fn send(
        &self,
        recipient: &RecipientId,
        message: &OutgoingMessage,
    ) -> Result<MessageId, ClientError> {
        self.pause().await;
        let mut state = self.script.lock();
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }
        state.sent.push(SentRecord {
            client: self.index,
            to: recipient.clone(),
            message: message.clone(),
        });
        Ok(MessageId(format!("msg-{}", state.sent.len())))
    }

    async fn logout(&self) -> Result<(), ClientError> {
        self.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

/// Factory recording every client it hands out.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    script: Arc<Script>,
    clients: Mutex<Vec<Arc<ScriptedClient>>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn created(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clients(&self) -> Vec<Arc<ScriptedClient>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn latest(&self) -> Option<Arc<ScriptedClient>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl ClientFactory for ScriptedFactory {
    fn create(&self, identity: &ClientIdentity) -> Arc<dyn AutomationClient> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let client = Arc::new(ScriptedClient::new(clients.len(), self.script.clone()));
        tracing::debug!(client = client.index, client_id = %identity.client_id, "scripted client created");
        clients.push(client.clone());
        client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_emits_scripted_events() {
        let factory = ScriptedFactory::new();
        factory.script().auto_qr(Some("2@qr")).auto_ready(false);
        let client = factory.create(&ClientIdentity::default());
        let mut rx = client.connect().await.unwrap();
        assert_eq!(rx.recv().await, Some(ClientEvent::Qr { code: "2@qr".into() }));
        let scripted = factory.latest().unwrap();
        assert!(scripted.emit(ClientEvent::Ready));
        assert_eq!(rx.recv().await, Some(ClientEvent::Ready));
        client.destroy().await.unwrap();
        assert!(!scripted.emit(ClientEvent::Ready));
    }

    #[tokio::test]
    async fn lookups_and_sends_follow_script() {
        let factory = ScriptedFactory::new();
        factory
            .script()
            .register(["919876543210@c.us"])
            .fail_sends([ClientError::Operation("Session closed".into())]);
        let client = factory.create(&ClientIdentity::default());
        let known = RecipientId::from_raw("919876543210@c.us");
        let unknown = RecipientId::from_raw("911111111111@c.us");
        assert!(client.resolve_recipient(&known).await.unwrap().is_some());
        assert!(client.resolve_recipient(&unknown).await.unwrap().is_none());
        assert!(client.send(&known, &OutgoingMessage::text("a")).await.is_err());
        client.send(&known, &OutgoingMessage::text("b")).await.unwrap();
        assert_eq!(factory.script().sent_texts(), vec!["b".to_string()]);
        assert_eq!(factory.script().lookups().len(), 2);
    }

    #[tokio::test]
    async fn connect_failures_are_consumed() {
        let factory = ScriptedFactory::new();
        factory.script().fail_connects(1);
        let client = factory.create(&ClientIdentity::default());
        assert!(client.connect().await.is_err());
        assert!(client.connect().await.is_ok());
        assert_eq!(factory.latest().unwrap().connects(), 2);
    }
}
