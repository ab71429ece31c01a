//! # Device Lifecycle - Connection Driver
//!
//! [`DeviceManager`] owns the one connection to the radio. `start` spawns a
//! driver task that connects, retries with linear backoff, and once
//! connected multiplexes four things over the single link:
//!
//! - inbound frames (events go to the ingest line, responses complete commands)
//! - queued commands from the [`CommandBridge`], one in flight at a time
//! - the in-flight command's deadline
//! - a periodic battery probe used as a health check
//!
//! A lost link fails every outstanding command with `DisconnectedMidFlight`,
//! revokes subscriptions and, with `auto_reconnect`, starts over at attempt 1.
//! The driver is the only retry authority; links never reconnect on their own.

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, Interval, MissedTickBehavior};

use super::bridge::{CommandBridge, Origin, PendingCommand};
use super::codec;
use super::commands::{CommandTimeouts, DeviceRequest, DeviceResponse, RequestId};
use super::events::{spawn_ingest, DeviceEvent, EventBus, IngestItem};
use super::ingest::{contact_from_device, register_handlers, IngestContext, PendingContacts};
use super::link::{Connector, DeviceLink, Inbound, TransportTarget};
use super::types::SelfInfo;
use crate::config::DeviceConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::live::LiveSink;
use crate::logutil::{escape_log, short_key};
use crate::metrics;
use crate::storage::{blocking, ContactSource, Store};

/// Storage setting that remembers the manual contact approval mode.
pub const MANUAL_ADD_SETTING: &str = "manual_add_contacts";

/// How long teardown waits for the ingest line to drain.
const INGEST_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// After a request expires, commands that share its response codes wait this
/// long so a late answer is not taken for theirs.
pub const LATE_ANSWER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based): `min(base * attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Connecting,
    Retrying,
    Connected,
    Disconnecting,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Retrying => "retrying",
            LifecycleState::Connected => "connected",
            LifecycleState::Disconnecting => "disconnecting",
        }
    }
}

/// Snapshot published by the driver on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: LifecycleState,
    pub connected: bool,
    /// Set once every attempt failed; cleared by the next `start`.
    pub unreachable: bool,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub transport: String,
    pub device_name: Option<String>,
    pub public_key: Option<String>,
    pub self_info: Option<SelfInfo>,
    pub since: DateTime<Utc>,
}

impl ConnectionStatus {
    fn idle(transport: String) -> Self {
        Self {
            state: LifecycleState::Idle,
            connected: false,
            unreachable: false,
            attempt: 0,
            last_error: None,
            transport,
            device_name: None,
            public_key: None,
            self_info: None,
            since: Utc::now(),
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    driver: JoinHandle<()>,
    ingest: JoinHandle<()>,
}

pub struct DeviceManager {
    pub(crate) config: DeviceConfig,
    connector: Arc<dyn Connector>,
    pub(crate) store: Arc<dyn Store>,
    sink: Arc<dyn LiveSink>,
    bus: Arc<EventBus>,
    bridge: Arc<CommandBridge>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    pub(crate) pending: Arc<PendingContacts>,
    running: Mutex<Option<Running>>,
}

impl DeviceManager {
    pub fn new(
        config: DeviceConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn Store>,
        sink: Arc<dyn LiveSink>,
    ) -> Self {
        let timeouts = CommandTimeouts {
            general: config.command_timeout(),
            probe: config.health_timeout(),
        };
        let (status, _) = watch::channel(ConnectionStatus::idle(config.transport().describe()));
        Self {
            config,
            connector,
            store,
            sink,
            bus: Arc::new(EventBus::new()),
            bridge: Arc::new(CommandBridge::new(timeouts)),
            status: Arc::new(status),
            pending: Arc::new(PendingContacts::default()),
            running: Mutex::new(None),
        }
    }

    /// Spawn the driver. Returns immediately; a second call while the driver
    /// is alive only logs a warning.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(r) = running.as_ref() {
            if !r.driver.is_finished() {
                warn!("Device manager already running; start ignored");
                return;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let ingest = spawn_ingest(self.bus.clone(), ingest_rx);
        let driver = Driver {
            config: self.config.clone(),
            connector: self.connector.clone(),
            ctx: IngestContext {
                store: self.store.clone(),
                sink: self.sink.clone(),
                pending: self.pending.clone(),
            },
            bus: self.bus.clone(),
            bridge: self.bridge.clone(),
            status: self.status.clone(),
            ingest: ingest_tx,
            shutdown: shutdown_rx,
        };
        self.status.send_modify(|s| {
            s.unreachable = false;
            s.last_error = None;
        });
        info!("Starting device manager ({})", self.config.transport());
        *running = Some(Running {
            shutdown: shutdown_tx,
            driver: tokio::spawn(driver.run()),
            ingest,
        });
    }

    /// Close the link, cancel the driver and clear subscriptions. Safe to
    /// call in any state, including never started.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running {
            shutdown,
            mut driver,
            ingest,
        }) = running
        else {
            self.settle_idle();
            return;
        };

        set_state(&self.status, self.sink.as_ref(), LifecycleState::Disconnecting);
        let _ = shutdown.send(true);
        let grace = self.config.close_timeout() + INGEST_FLUSH_TIMEOUT;
        if tokio::time::timeout(grace, &mut driver).await.is_err() {
            warn!("Driver did not stop within {}s; aborting", grace.as_secs());
            driver.abort();
        }
        self.bridge.detach();
        self.bus.unsubscribe_all();
        if tokio::time::timeout(INGEST_FLUSH_TIMEOUT, ingest).await.is_err() {
            warn!("Ingest line did not drain on stop");
        }
        self.settle_idle();
        info!("Device manager stopped");
    }

    fn settle_idle(&self) {
        self.status.send_modify(|s| {
            s.connected = false;
            if s.state != LifecycleState::Idle {
                s.state = LifecycleState::Idle;
                s.since = Utc::now();
            }
        });
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected && self.bridge.is_attached()
    }

    pub fn bridge(&self) -> &Arc<CommandBridge> {
        &self.bridge
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

fn set_state(status: &watch::Sender<ConnectionStatus>, sink: &dyn LiveSink, state: LifecycleState) {
    update_status(status, sink, |s| s.state = state);
}

/// Apply `f` and publish a `status` update when the state changed.
fn update_status<F>(status: &watch::Sender<ConnectionStatus>, sink: &dyn LiveSink, f: F)
where
    F: FnOnce(&mut ConnectionStatus),
{
    let mut changed = false;
    status.send_modify(|s| {
        let before = s.state;
        f(s);
        if s.state != before {
            s.since = Utc::now();
            changed = true;
        }
    });
    if changed {
        if let Ok(payload) = serde_json::to_value(&*status.borrow()) {
            sink.publish("status", payload);
        }
    }
}

/// Resolves once stop was requested or the manager went away.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// One live connection as seen by the driver.
struct Session {
    link: Box<dyn DeviceLink>,
    submit_rx: mpsc::UnboundedReceiver<PendingCommand>,
    ready: VecDeque<PendingCommand>,
    in_flight: Option<PendingCommand>,
    sync_queued: bool,
    quiet: Option<Quiet>,
}

/// A request that expired unanswered. Its late answer may still arrive.
struct Quiet {
    id: RequestId,
    request: DeviceRequest,
    until: Instant,
}

impl Quiet {
    fn holds(&self, request: &DeviceRequest) -> bool {
        Instant::now() < self.until && codec::share_answers(&self.request, request)
    }
}

enum SessionEnd {
    Stopped,
    Lost(String),
}

struct Driver {
    config: DeviceConfig,
    connector: Arc<dyn Connector>,
    ctx: IngestContext,
    bus: Arc<EventBus>,
    bridge: Arc<CommandBridge>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    ingest: mpsc::UnboundedSender<IngestItem>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    fn update<F: FnOnce(&mut ConnectionStatus)>(&self, f: F) {
        update_status(&self.status, self.ctx.sink.as_ref(), f);
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(self) {
        let policy = self.config.retry_policy();
        let max_attempts = policy.max_retries.max(1);
        let target = self.config.transport();
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0u32;

        loop {
            if self.stopping() {
                break;
            }
            attempt += 1;
            self.update(|s| {
                s.state = LifecycleState::Connecting;
                s.attempt = attempt;
                s.connected = false;
            });
            metrics::inc_connect_attempts();
            info!("Connecting to {} (attempt {}/{})", target, attempt, max_attempts);

            let outcome = tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                outcome = self.connect(&target) => outcome,
            };

            match outcome {
                Ok(session) => {
                    attempt = 0;
                    match self.serve(session).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost(reason) => {
                            if !self.config.auto_reconnect {
                                info!("Connection lost ({}); auto-reconnect disabled", reason);
                                self.update(|s| s.state = LifecycleState::Idle);
                                return;
                            }
                            metrics::inc_reconnects();
                            info!("Connection lost ({}); reconnecting", reason);
                        }
                    }
                }
                Err(e) => {
                    warn!("Connect attempt {} to {} failed: {}", attempt, target, e);
                    if attempt >= max_attempts {
                        let err = GatewayError::Unreachable { attempts: attempt };
                        error!("{} ({}): {}", err, target, e);
                        self.update(|s| {
                            s.state = LifecycleState::Idle;
                            s.connected = false;
                            s.unreachable = true;
                            s.last_error = Some(format!("{}: {}", err, e));
                        });
                        return;
                    }
                    let delay = policy.delay_for(attempt);
                    self.update(|s| {
                        s.state = LifecycleState::Retrying;
                        s.last_error = Some(e.to_string());
                    });
                    info!("Retrying in {}s", delay.as_secs());
                    tokio::select! {
                        _ = stop_requested(&mut shutdown) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!("Driver for {} exiting", target);
    }

    /// Open the link and bring the session up. A half-open link is closed
    /// before the error is returned.
    async fn connect(&self, target: &TransportTarget) -> GatewayResult<Session> {
        let limit = self.config.connect_timeout();
        let mut link = tokio::time::timeout(limit, self.connector.connect(target))
            .await
            .map_err(|_| {
                GatewayError::ConnectFailed(format!(
                    "timed out after {}s opening {}",
                    limit.as_secs(),
                    target
                ))
            })??;

        match self.handshake(&mut link).await {
            Ok(info) => {
                let session = Session {
                    link,
                    submit_rx: self.bridge.attach(),
                    ready: VecDeque::new(),
                    in_flight: None,
                    sync_queued: false,
                    quiet: None,
                };
                self.update(|s| {
                    s.state = LifecycleState::Connected;
                    s.connected = true;
                    s.unreachable = false;
                    s.last_error = None;
                    s.device_name = Some(info.name.clone());
                    s.public_key = Some(info.public_key.clone());
                    s.self_info = Some(info.clone());
                });
                metrics::inc_connects();
                info!(
                    "Connected to {} ({}) via {}",
                    escape_log(&info.name),
                    short_key(&info.public_key),
                    session.link.describe()
                );
                Ok(session)
            }
            Err(e) => {
                self.close_link(&mut link).await;
                // Events forwarded during warm-up still carry this epoch.
                self.flush_ingest().await;
                self.bus.unsubscribe_all();
                Err(e)
            }
        }
    }

    async fn handshake(&self, link: &mut Box<dyn DeviceLink>) -> GatewayResult<SelfInfo> {
        let limit = self.config.connect_timeout();
        let info = tokio::time::timeout(limit, link.self_info())
            .await
            .map_err(|_| GatewayError::Timeout {
                command: "app_start",
                after: limit,
            })??;
        let info_json = serde_json::to_value(&info).ok();
        blocking(|| {
            self.ctx
                .store
                .set_device_info(&info.public_key, &info.name, info_json.as_ref())
        })?;
        register_handlers(&self.bus, &self.ctx);

        // Warm-up: mirror the device contact table.
        let contacts = match self.warm_up(link, DeviceRequest::GetContacts).await? {
            DeviceResponse::Contacts(list) => list,
            other => {
                return Err(GatewayError::ConnectFailed(format!(
                    "unexpected {} response to get_contacts",
                    other.kind()
                )))
            }
        };
        blocking(|| {
            contacts.iter().try_for_each(|contact| {
                self.ctx
                    .store
                    .upsert_contact(&contact_from_device(contact, ContactSource::Device))
            })
        })?;
        debug!("Synced {} contacts from device", contacts.len());

        let manual = self.desired_manual_add().unwrap_or(info.manual_add_contacts);
        self.ctx.pending.set_enabled(manual);
        if manual != info.manual_add_contacts {
            let request = DeviceRequest::SetOtherParams {
                manual_add_contacts: manual,
                telemetry_modes: info.telemetry_modes,
                advert_loc_policy: info.advert_loc_policy,
                multi_acks: info.multi_acks,
            };
            match self.warm_up(link, request).await {
                Ok(_) => info!("Manual contact approval {}", if manual { "enabled" } else { "disabled" }),
                Err(e) if e.is_link_failure() => return Err(e),
                Err(e) => warn!("Could not apply manual contact approval mode: {}", e),
            }
        }
        Ok(info)
    }

    fn desired_manual_add(&self) -> Option<bool> {
        if let Some(v) = self.config.manual_add_contacts {
            return Some(v);
        }
        match self.ctx.store.get_setting(MANUAL_ADD_SETTING) {
            Ok(v) => v.map(|s| s == "true" || s == "1"),
            Err(e) => {
                warn!("Could not read {} setting: {}", MANUAL_ADD_SETTING, e);
                None
            }
        }
    }

    /// A request written straight to the link before the bridge is attached.
    /// Events arriving meanwhile go to the ingest line as usual.
    async fn warm_up(
        &self,
        link: &mut Box<dyn DeviceLink>,
        request: DeviceRequest,
    ) -> GatewayResult<DeviceResponse> {
        let id = self.bridge.allocate_id();
        let limit = request.default_timeout(&self.bridge.timeouts());
        link.send(id, &request).await?;
        let until = Instant::now() + limit;
        loop {
            let inbound = tokio::time::timeout_at(until, link.recv())
                .await
                .map_err(|_| GatewayError::Timeout {
                    command: request.name(),
                    after: limit,
                })??;
            match inbound {
                Inbound::Response { id: got, result } if got == id => {
                    return result.map_err(GatewayError::DeviceRejected)
                }
                Inbound::Response { id: got, .. } => {
                    debug!("Ignoring response for request {} during warm-up", got);
                }
                Inbound::Event(DeviceEvent::Disconnected { reason }) => {
                    return Err(GatewayError::transport(reason))
                }
                Inbound::Event(event) => self.forward(event),
                Inbound::MessagesWaiting => {}
            }
        }
    }

    fn forward(&self, event: DeviceEvent) {
        let stamped = self.bus.stamp(event);
        if self.ingest.send(IngestItem::Event(stamped)).is_err() {
            warn!("Ingest line closed; event dropped");
        }
    }

    async fn flush_ingest(&self) {
        let (tx, rx) = oneshot::channel();
        if self.ingest.send(IngestItem::Barrier(tx)).is_ok()
            && tokio::time::timeout(INGEST_FLUSH_TIMEOUT, rx).await.is_err()
        {
            warn!("Ingest line did not drain within {}s", INGEST_FLUSH_TIMEOUT.as_secs());
        }
    }

    async fn close_link(&self, link: &mut Box<dyn DeviceLink>) {
        let limit = self.config.close_timeout();
        match tokio::time::timeout(limit, link.close()).await {
            Ok(Ok(())) => debug!("Closed {}", link.describe()),
            Ok(Err(e)) => debug!("Error closing {}: {}", link.describe(), e),
            Err(_) => warn!("Closing {} timed out after {}s", link.describe(), limit.as_secs()),
        }
    }

    fn queue_internal(&self, session: &mut Session, request: DeviceRequest, origin: Origin) {
        let timeout = match origin {
            Origin::Health => self.config.health_timeout(),
            _ => request.default_timeout(&self.bridge.timeouts()),
        };
        session.ready.push_back(PendingCommand::internal(
            self.bridge.allocate_id(),
            request,
            timeout,
            origin,
        ));
    }

    fn queue_sync(&self, session: &mut Session) {
        if !session.sync_queued {
            session.sync_queued = true;
            self.queue_internal(session, DeviceRequest::SyncNextMessage, Origin::Sync);
        }
    }

    /// Write the next live command, skipping ones whose caller gave up.
    async fn write_next(&self, session: &mut Session) -> GatewayResult<()> {
        loop {
            let next = match session.ready.pop_front() {
                Some(cmd) => cmd,
                None => match session.submit_rx.try_recv() {
                    Ok(cmd) => cmd,
                    Err(_) => return Ok(()),
                },
            };
            if next.is_abandoned() {
                metrics::inc_commands_abandoned();
                debug!("Skipping {} (id {}): caller gave up", next.request.name(), next.id);
                continue;
            }
            if Instant::now() >= next.deadline {
                let err = next.timeout_error();
                next.complete(Err(err));
                continue;
            }
            if let Some(quiet) = &session.quiet {
                if quiet.holds(&next.request) {
                    trace!(
                        "Holding {} (id {}) until the answer to {} can no longer arrive",
                        next.request.name(),
                        next.id,
                        quiet.request.name()
                    );
                    session.ready.push_front(next);
                    return Ok(());
                }
            }
            if next.origin == Origin::Sync {
                session.sync_queued = false;
            }
            trace!("Writing {} (id {})", next.request.name(), next.id);
            if let Err(e) = session.link.send(next.id, &next.request).await {
                next.complete(Err(GatewayError::DisconnectedMidFlight));
                return Err(e);
            }
            session.in_flight = Some(next);
            return Ok(());
        }
    }

    async fn serve(&self, mut session: Session) -> SessionEnd {
        let mut shutdown = self.shutdown.clone();
        let mut health = self.config.health_interval().map(|every| {
            let mut i = tokio::time::interval_at(Instant::now() + every, every);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });
        // Drain whatever queued up while we were away.
        self.queue_sync(&mut session);

        loop {
            if session.in_flight.is_none() {
                if let Err(e) = self.write_next(&mut session).await {
                    return self.lose(session, format!("write failed: {}", e)).await;
                }
            }
            let idle = session.in_flight.is_none();
            let expires = session.in_flight.as_ref().map(|c| c.deadline);
            let resume = session
                .quiet
                .as_ref()
                .filter(|_| idle && !session.ready.is_empty())
                .map(|q| q.until);

            tokio::select! {
                _ = stop_requested(&mut shutdown) => {
                    self.teardown(session, "stopped").await;
                    return SessionEnd::Stopped;
                }
                inbound = session.link.recv() => match inbound {
                    Ok(item) => {
                        if let Err(reason) = self.on_inbound(&mut session, item) {
                            return self.lose(session, reason).await;
                        }
                    }
                    Err(e) => return self.lose(session, e.to_string()).await,
                },
                Some(cmd) = session.submit_rx.recv(), if idle => {
                    session.ready.push_back(cmd);
                }
                _ = deadline(expires) => {
                    if let Some(cmd) = session.in_flight.take() {
                        warn!("{} (id {}) got no answer within {}s", cmd.request.name(), cmd.id, cmd.timeout.as_secs());
                        if cmd.origin == Origin::Health {
                            return self.lose(session, "health check timed out".to_string()).await;
                        }
                        session.quiet = Some(Quiet {
                            id: cmd.id,
                            request: cmd.request.clone(),
                            until: Instant::now() + LATE_ANSWER_GRACE,
                        });
                        let err = cmd.timeout_error();
                        cmd.complete(Err(err));
                    }
                }
                _ = deadline(resume) => {
                    session.quiet = None;
                }
                _ = next_tick(&mut health) => {
                    let probing = session.ready.iter().any(|c| c.origin == Origin::Health)
                        || session.in_flight.as_ref().map(|c| c.origin == Origin::Health).unwrap_or(false);
                    if !probing {
                        self.queue_internal(&mut session, DeviceRequest::GetBattery, Origin::Health);
                    }
                }
            }
        }
    }

    /// Route one inbound item. `Err` carries the reason the link is gone.
    fn on_inbound(&self, session: &mut Session, item: Inbound) -> Result<(), String> {
        match item {
            Inbound::Event(DeviceEvent::Disconnected { reason }) => Err(reason),
            Inbound::Event(event) => {
                self.forward(event);
                Ok(())
            }
            Inbound::MessagesWaiting => {
                self.queue_sync(session);
                Ok(())
            }
            Inbound::Response { id, result } => {
                match session.in_flight.take() {
                    Some(cmd) if cmd.id == id => self.complete(session, cmd, result),
                    other => {
                        session.in_flight = other;
                        metrics::inc_late_responses();
                        debug!("Discarding late response for request {}", id);
                        if session.quiet.as_ref().map(|q| q.id) == Some(id) {
                            session.quiet = None;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn complete(
        &self,
        session: &mut Session,
        cmd: PendingCommand,
        result: Result<DeviceResponse, String>,
    ) {
        match cmd.origin {
            Origin::Sync => match result {
                Ok(DeviceResponse::Message(event)) => {
                    self.forward(event);
                    self.queue_sync(session);
                }
                Ok(DeviceResponse::NoMoreMessages) => trace!("Message queue drained"),
                Ok(other) => debug!("Unexpected {} response to sync", other.kind()),
                Err(e) => warn!("Message sync rejected by device: {}", e),
            },
            Origin::Health => match result {
                Ok(DeviceResponse::Battery(b)) => trace!("Health check ok ({} mV)", b.millivolts),
                Ok(_) => trace!("Health check ok"),
                Err(e) => warn!("Health check rejected by device: {}", e),
            },
            Origin::Caller => {
                if let Ok(DeviceResponse::Sent(sent)) = &result {
                    self.forward(DeviceEvent::MessageSent(sent.clone()));
                }
                cmd.complete(result.map_err(GatewayError::DeviceRejected));
            }
        }
    }

    async fn lose(&self, session: Session, reason: String) -> SessionEnd {
        warn!("Lost connection to device: {}", reason);
        self.bridge.detach();
        let next = if self.config.auto_reconnect && !self.stopping() {
            LifecycleState::Connecting
        } else {
            LifecycleState::Idle
        };
        self.update(|s| {
            s.connected = false;
            s.state = next;
            s.last_error = Some(reason.clone());
        });
        self.forward(DeviceEvent::Disconnected {
            reason: reason.clone(),
        });
        self.teardown(session, &reason).await;
        SessionEnd::Lost(reason)
    }

    /// Fail everything outstanding, close the link and retire the epoch.
    async fn teardown(&self, session: Session, reason: &str) {
        self.bridge.detach();
        let Session {
            mut link,
            mut submit_rx,
            ready,
            in_flight,
            ..
        } = session;

        let mut failed = 0usize;
        if let Some(cmd) = in_flight {
            cmd.complete(Err(GatewayError::DisconnectedMidFlight));
            failed += 1;
        }
        for cmd in ready {
            cmd.complete(Err(GatewayError::DisconnectedMidFlight));
            failed += 1;
        }
        submit_rx.close();
        while let Ok(cmd) = submit_rx.try_recv() {
            cmd.complete(Err(GatewayError::DisconnectedMidFlight));
            failed += 1;
        }
        if failed > 0 {
            info!("Failed {} outstanding command(s): {}", failed, reason);
        }

        self.close_link(&mut link).await;
        drop(link);
        self.flush_ingest().await;
        self.bus.unsubscribe_all();
        self.update(|s| s.connected = false);
    }
}
