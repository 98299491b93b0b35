use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use wa_core::{AutomationClient, ClientEvent, ClientFactory, ConnectionState};

use crate::SessionError;
use crate::config::SessionConfig;
use crate::machine::{Effect, QrCode, SessionEvent, SessionMachine, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitOutcome {
    Started,
    AlreadyInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusLabel {
    Disconnected,
    Connecting,
    QrReady,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrInfo {
    pub available: bool,
    pub expires_in: u64,
    pub generated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrSnapshot {
    pub code: String,
    pub expires_in: u64,
    pub generated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub status: StatusLabel,
    pub state: SessionState,
    pub qr_code: Option<QrInfo>,
    pub reconnect_attempts: u32,
    pub monitor_active: bool,
}

/// Async work produced by a transition, run after the state lock is released.
enum Work {
    Start {
        generation: u64,
        previous: Option<Arc<dyn AutomationClient>>,
    },
    Destroy(Arc<dyn AutomationClient>),
    Close(Arc<dyn AutomationClient>),
}

struct Inner {
    machine: SessionMachine,
    client: Option<Arc<dyn AutomationClient>>,
    /// Bumped whenever the live client is replaced or dropped; events tagged with an older
    /// generation are discarded.
    generation: u64,
    monitor: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    /// Fires `StartTimedOut` for the generation it was armed for.
    deadline: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Inner {
    fn detach_client(&mut self) -> Option<Arc<dyn AutomationClient>> {
        self.generation += 1;
        abort(&mut self.pump);
        self.client.take()
    }
}

fn abort(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

fn rounded_secs(duration: Duration) -> u64 {
    (duration.as_millis() as u64).saturating_add(500) / 1000
}

/// Drives the session state machine against a live automation client.
///
/// All state lives behind one synchronous lock that is never held across an await. Client
/// starts and teardowns are additionally serialized through an async lock so at most one client
/// is alive at any time.
pub struct SessionController {
    config: SessionConfig,
    factory: Arc<dyn ClientFactory>,
    inner: Mutex<Inner>,
    start_lock: AsyncMutex<()>,
    this: Weak<SessionController>,
}

impl SessionController {
    pub fn new(config: SessionConfig, factory: Arc<dyn ClientFactory>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner: Mutex::new(Inner {
                machine: SessionMachine::new(config.clone()),
                client: None,
                generation: 0,
                monitor: None,
                timer: None,
                deadline: None,
                pump: None,
            }),
            config,
            factory,
            start_lock: AsyncMutex::new(()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().machine.state()
    }

    /// Starts a fresh client, replacing any existing one.
    ///
    /// Returns once the client has been created and connected (or its start has failed and a
    /// retry was scheduled). A call made while another start is in flight is a no-op.
    pub async fn initialize(&self) -> Result<InitOutcome, SessionError> {
        let work = {
            let mut inner = self.lock();
            match self.transition(&mut inner, SessionEvent::Initialize) {
                Ok(work) => work,
                Err(SessionError::AlreadyInitializing) => {
                    debug!("initialization already in progress");
                    return Ok(InitOutcome::AlreadyInProgress);
                }
                Err(err) => return Err(err),
            }
        };
        self.perform(work).await;
        Ok(InitOutcome::Started)
    }

    /// Whether a pairing token is available; expired tokens are dropped on the way.
    pub fn is_qr_valid(&self) -> bool {
        self.lock().machine.qr_valid_at(Instant::now())
    }

    pub fn qr(&self) -> Option<QrSnapshot> {
        let now = Instant::now();
        let mut inner = self.lock();
        if !inner.machine.qr_valid_at(now) {
            return None;
        }
        inner.machine.qr().map(|qr| QrSnapshot {
            code: qr.code.clone(),
            expires_in: rounded_secs(qr.remaining_at(now, self.config.qr_ttl)),
            generated_at: rfc3339(qr.issued_at_utc),
        })
    }

    pub fn status(&self) -> SessionStatus {
        let now = Instant::now();
        let mut inner = self.lock();
        let qr_valid = inner.machine.qr_valid_at(now);
        let state = inner.machine.state();
        let qr_code = if qr_valid {
            inner.machine.qr().map(|qr| QrInfo {
                available: true,
                expires_in: rounded_secs(qr.remaining_at(now, self.config.qr_ttl)),
                generated_at: rfc3339(qr.issued_at_utc),
            })
        } else {
            None
        };
        let status = if qr_code.is_some() {
            StatusLabel::QrReady
        } else {
            match state {
                SessionState::Connected => StatusLabel::Ready,
                SessionState::Initializing | SessionState::AwaitingQrScan => StatusLabel::Connecting,
                _ => StatusLabel::Disconnected,
            }
        };
        SessionStatus {
            status,
            state,
            qr_code,
            reconnect_attempts: inner.machine.reconnect_attempts(),
            monitor_active: inner.monitor.as_ref().is_some_and(|h| !h.is_finished()),
        }
    }

    /// The live client, only while the session is connected.
    pub fn ready_client(&self) -> Option<Arc<dyn AutomationClient>> {
        self.connected_client().map(|(client, _)| client)
    }

    fn connected_client(&self) -> Option<(Arc<dyn AutomationClient>, u64)> {
        let inner = self.lock();
        if inner.machine.state() != SessionState::Connected {
            return None;
        }
        inner
            .client
            .as_ref()
            .map(|client| (client.clone(), inner.generation))
    }

    /// Connected and the client confirms it within the health timeout.
    pub async fn is_healthy(&self) -> bool {
        match self.connected_client() {
            Some((client, _)) => self.query_state(client.as_ref()).await.is_ok(),
            None => false,
        }
    }

    /// Polls [`Self::is_healthy`] up to `max_checks` times, `delay` apart.
    pub async fn wait_for_ready(&self, max_checks: u32, delay: Duration) -> bool {
        let checks = max_checks.max(1);
        for check in 1..=checks {
            if self.is_healthy().await {
                return true;
            }
            debug!(check, checks, "session not ready");
            if check < checks {
                tokio::time::sleep(delay).await;
            }
        }
        warn!(checks, "session not ready after all checks");
        false
    }

    /// Tears the client down without unlinking the device. No reconnect follows.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let work = {
            let mut inner = self.lock();
            self.transition(&mut inner, SessionEvent::Logout)?
        };
        self.perform(work).await;
        info!("session disconnected on request");
        Ok(())
    }

    /// Unlinks the device and deletes persisted credentials so the next start pairs afresh.
    pub async fn clear_session(&self) -> Result<(), SessionError> {
        let work = {
            let mut inner = self.lock();
            self.transition(&mut inner, SessionEvent::Logout)?
        };
        {
            let _start = self.start_lock.lock().await;
            for item in work {
                if let Work::Destroy(client) = item {
                    match tokio::time::timeout(self.config.client_close_timeout, client.logout())
                        .await
                    {
                        Ok(Ok(())) => info!("device unlinked"),
                        Ok(Err(err)) => warn!(error = %err, "logout failed"),
                        Err(_) => warn!("logout timed out"),
                    }
                    self.close_client(client.as_ref(), "destroy").await;
                }
            }
        }

        let path = self.config.identity.session_path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "session data removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no session data to remove");
                Ok(())
            }
            Err(source) => Err(SessionError::Storage {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Stops timers and the monitor and closes the client, waiting at most `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let work = {
            let mut inner = self.lock();
            match self.transition(&mut inner, SessionEvent::Shutdown) {
                Ok(work) => work,
                Err(err) => {
                    warn!(error = %err, "shutdown transition rejected");
                    Vec::new()
                }
            }
        };
        if tokio::time::timeout(grace, self.perform(work)).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "client did not close within grace period");
        }
        info!("session shut down");
    }

    fn transition(
        &self,
        inner: &mut Inner,
        event: SessionEvent,
    ) -> Result<Vec<Work>, SessionError> {
        let from = inner.machine.state();
        let name = event.name();
        let effects = inner.machine.apply(event)?;
        let to = inner.machine.state();
        if from != to {
            info!(from = from.as_str(), to = to.as_str(), event = name, "session state changed");
            counter!("wa_session_transitions_total", "from" => from.as_str(), "to" => to.as_str())
                .increment(1);
        }

        let mut work = Vec::new();
        for effect in effects {
            match effect {
                Effect::StartClient => {
                    let previous = inner.detach_client();
                    abort(&mut inner.deadline);
                    inner.deadline = Some(self.spawn_deadline(inner.generation));
                    work.push(Work::Start {
                        generation: inner.generation,
                        previous,
                    });
                }
                Effect::DestroyClient => {
                    if let Some(client) = inner.detach_client() {
                        work.push(Work::Destroy(client));
                    }
                }
                Effect::CloseClient => {
                    if let Some(client) = inner.detach_client() {
                        work.push(Work::Close(client));
                    }
                }
                Effect::StartMonitor => {
                    abort(&mut inner.monitor);
                    inner.monitor = Some(self.spawn_monitor());
                }
                Effect::StopMonitor => abort(&mut inner.monitor),
                Effect::ScheduleReconnect { attempt, delay } => {
                    info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                    counter!("wa_reconnect_scheduled_total").increment(1);
                    abort(&mut inner.timer);
                    inner.timer = Some(self.spawn_timer(delay, SessionEvent::ReconnectDue));
                }
                Effect::ScheduleStartRetry { delay } => {
                    info!(delay_ms = delay.as_millis() as u64, "start retry scheduled");
                    abort(&mut inner.timer);
                    inner.timer = Some(self.spawn_timer(delay, SessionEvent::StartRetryDue));
                }
                Effect::CancelTimers => abort(&mut inner.timer),
            }
        }
        Ok(work)
    }

    async fn perform(&self, work: Vec<Work>) {
        for item in work {
            match item {
                Work::Start {
                    generation,
                    previous,
                } => self.start_client(generation, previous).await,
                Work::Destroy(client) => {
                    let _start = self.start_lock.lock().await;
                    self.close_client(client.as_ref(), "destroy").await;
                }
                Work::Close(client) => {
                    let _start = self.start_lock.lock().await;
                    self.close_client(client.as_ref(), "close").await;
                }
            }
        }
    }

    /// Runs `work` on its own task so the caller (a timer, the monitor or an event pump) may be
    /// aborted by the very transition that produced it.
    fn perform_detached(&self, work: Vec<Work>) {
        if work.is_empty() {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            tokio::spawn(async move { this.perform(work).await });
        }
    }

    fn dispatch(&self, event: SessionEvent) {
        let result = {
            let mut inner = self.lock();
            self.transition(&mut inner, event)
        };
        match result {
            Ok(work) => self.perform_detached(work),
            Err(err) => debug!(error = %err, "event rejected"),
        }
    }

    fn dispatch_for_generation(&self, generation: u64, event: SessionEvent) {
        let result = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(
                    generation,
                    current = inner.generation,
                    event = event.name(),
                    "stale client event dropped"
                );
                return;
            }
            self.transition(&mut inner, event)
        };
        match result {
            Ok(work) => self.perform_detached(work),
            Err(err) => debug!(error = %err, "event rejected"),
        }
    }

    async fn start_client(&self, generation: u64, previous: Option<Arc<dyn AutomationClient>>) {
        let _start = self.start_lock.lock().await;
        if let Some(previous) = previous {
            self.close_client(previous.as_ref(), "destroy").await;
        }
        if !self.is_current(generation) {
            debug!(generation, "client start superseded");
            return;
        }

        let identity = &self.config.identity;
        info!(generation, client_id = %identity.client_id, "starting automation client");
        let client = self.factory.create(identity);
        match client.connect().await {
            Ok(events) => {
                let accepted = {
                    let mut inner = self.lock();
                    if inner.generation == generation {
                        inner.client = Some(client.clone());
                        inner.pump = Some(self.spawn_pump(generation, events));
                        true
                    } else {
                        false
                    }
                };
                if !accepted {
                    debug!(generation, "discarding client started for a superseded session");
                    self.close_client(client.as_ref(), "destroy").await;
                }
            }
            Err(err) => {
                error!(generation, error = %err, "automation client failed to start");
                self.close_client(client.as_ref(), "destroy").await;
                self.dispatch_for_generation(
                    generation,
                    SessionEvent::StartFailed {
                        error: err.to_string(),
                    },
                );
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    async fn close_client(&self, client: &dyn AutomationClient, op: &'static str) {
        match tokio::time::timeout(self.config.client_close_timeout, client.destroy()).await {
            Ok(Ok(())) => debug!(op, "client closed"),
            Ok(Err(err)) => warn!(op, error = %err, "client close failed"),
            Err(_) => warn!(op, "client close timed out"),
        }
    }

    async fn query_state(&self, client: &dyn AutomationClient) -> Result<(), String> {
        match tokio::time::timeout(self.config.health_timeout, client.state()).await {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(state)) => Err(format!("client state is {state:?}")),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("state query timed out".to_string()),
        }
    }

    async fn run_health_check(&self) {
        let Some((client, generation)) = self.connected_client() else {
            return;
        };
        match self.query_state(client.as_ref()).await {
            Ok(()) => debug!("session healthy"),
            Err(detail) => {
                warn!(%detail, "session unhealthy, recovering");
                self.dispatch_for_generation(generation, SessionEvent::HealthCheckFailed { detail });
            }
        }
    }

    fn on_client_event(&self, generation: u64, event: ClientEvent) {
        let session_event = match event {
            ClientEvent::Qr { code } => {
                info!("pairing token issued");
                SessionEvent::QrIssued(QrCode {
                    code,
                    issued_at: Instant::now(),
                    issued_at_utc: OffsetDateTime::now_utc(),
                })
            }
            ClientEvent::Ready => SessionEvent::Ready,
            ClientEvent::Disconnected { reason } => {
                warn!(%reason, "automation client disconnected");
                SessionEvent::ClientDisconnected { reason }
            }
            ClientEvent::Authenticated => {
                info!("client authenticated");
                return;
            }
            ClientEvent::AuthFailure { message } => {
                warn!(%message, "client authentication failed");
                SessionEvent::AuthFailed { message }
            }
            ClientEvent::Loading { percent, message } => {
                debug!(percent, %message, "loading");
                return;
            }
            ClientEvent::StateChanged { state } => {
                debug!(%state, "client state changed");
                return;
            }
            ClientEvent::MessageReceived { from } => {
                debug!(%from, "message received");
                return;
            }
        };
        self.dispatch_for_generation(generation, session_event);
    }

    fn spawn_pump(
        &self,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<ClientEvent>,
    ) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(controller) = this.upgrade() else {
                    break;
                };
                controller.on_client_event(generation, event);
            }
            debug!(generation, "client event stream ended");
        })
    }

    fn spawn_monitor(&self) -> JoinHandle<()> {
        let this = self.this.clone();
        let period = self.config.monitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(controller) = this.upgrade() else {
                    break;
                };
                controller.run_health_check().await;
            }
        })
    }

    fn spawn_deadline(&self, generation: u64) -> JoinHandle<()> {
        let this = self.this.clone();
        let limit = self.config.start_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if let Some(controller) = this.upgrade() {
                if controller.is_current(generation)
                    && controller.state() == SessionState::Initializing
                {
                    warn!(generation, limit_s = limit.as_secs(), "client start timed out");
                }
                controller.dispatch_for_generation(generation, SessionEvent::StartTimedOut);
            }
        })
    }

    fn spawn_timer(&self, delay: Duration, event: SessionEvent) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(controller) = this.upgrade() {
                controller.dispatch(event);
            }
        })
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        abort(&mut inner.monitor);
        abort(&mut inner.timer);
        abort(&mut inner.deadline);
        abort(&mut inner.pump);
    }
}
