//! Test utilities & fixtures.
//! A scripted in-memory radio standing in for the companion link.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use meshgate::config::DeviceConfig;
use meshgate::device::{
    BatteryInfo, ChannelInfo, Connector, DeviceEvent, DeviceInfo, DeviceLink, DeviceManager,
    DeviceRequest, DeviceResponse, Inbound, RequestId, SelfInfo, SentInfo, TransportTarget,
};
use meshgate::error::{GatewayError, GatewayResult};
use meshgate::live::BroadcastSink;
use meshgate::storage::SqliteStore;

pub const DEVICE_KEY: &str = "5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a";
pub const PUBLIC_SECRET: &str = "8b3387e9c5cdea6ac9e5edbaa115cd72";

/// Decides what the radio answers; `None` means it never answers.
pub type Responder = Arc<dyn Fn(&DeviceRequest) -> Option<Result<DeviceResponse, String>> + Send + Sync>;

enum Control {
    Event(DeviceEvent),
    MessagesWaiting,
    Drop(String),
}

pub fn sample_self_info() -> SelfInfo {
    SelfInfo {
        name: "Base Camp".to_string(),
        public_key: DEVICE_KEY.to_string(),
        adv_type: 1,
        tx_power: 20,
        max_tx_power: 22,
        adv_lat: None,
        adv_lon: None,
        multi_acks: 0,
        advert_loc_policy: 0,
        telemetry_modes: 0,
        manual_add_contacts: false,
        radio_freq_khz: 869_525,
        radio_bw_hz: 250_000,
        radio_sf: 11,
        radio_cr: 5,
    }
}

/// What a healthy radio answers to each request.
pub fn default_response(request: &DeviceRequest) -> Option<Result<DeviceResponse, String>> {
    let response = match request {
        DeviceRequest::AppStart => DeviceResponse::SelfInfo(sample_self_info()),
        DeviceRequest::GetContacts => DeviceResponse::Contacts(Vec::new()),
        DeviceRequest::SendDirectMessage { .. } => DeviceResponse::Sent(SentInfo {
            flood: false,
            expected_ack: "a1b2c3d4".to_string(),
            suggested_timeout_ms: 5000,
        }),
        DeviceRequest::GetBattery => DeviceResponse::Battery(BatteryInfo {
            millivolts: 4100,
            used_kb: None,
            total_kb: None,
        }),
        DeviceRequest::DeviceQuery => DeviceResponse::DeviceInfo(DeviceInfo {
            firmware_version: 8,
            max_contacts: Some(350),
            max_channels: Some(8),
            ble_pin: None,
            build_date: Some("1 Oct 2025".to_string()),
            model: Some("Heltec V3".to_string()),
            version: Some("v1.9.0".to_string()),
        }),
        DeviceRequest::GetChannel(index) => DeviceResponse::Channel(if *index == 0 {
            ChannelInfo {
                index: 0,
                name: "Public".to_string(),
                secret: PUBLIC_SECRET.to_string(),
            }
        } else {
            ChannelInfo {
                index: *index,
                name: String::new(),
                secret: "0".repeat(32),
            }
        }),
        DeviceRequest::SyncNextMessage => DeviceResponse::NoMoreMessages,
        _ => DeviceResponse::Ok,
    };
    Some(Ok(response))
}

/// Shared state of the fake radio, inspected by tests.
pub struct MockRadio {
    pub connect_attempts: AtomicU32,
    pub live_links: AtomicU32,
    pub max_live_links: AtomicU32,
    /// Connects still to refuse; `u32::MAX` refuses forever.
    failing_connects: AtomicU32,
    responder: Mutex<Responder>,
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    waiting: Mutex<VecDeque<DeviceEvent>>,
    /// Events written to the wire just ahead of the next answer.
    preludes: Mutex<VecDeque<DeviceEvent>>,
    sent: Mutex<Vec<DeviceRequest>>,
}

impl MockRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connect_attempts: AtomicU32::new(0),
            live_links: AtomicU32::new(0),
            max_live_links: AtomicU32::new(0),
            failing_connects: AtomicU32::new(0),
            responder: Mutex::new(Arc::new(default_response)),
            control: Mutex::new(None),
            waiting: Mutex::new(VecDeque::new()),
            preludes: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        let radio = Self::new();
        radio.fail_next_connects(u32::MAX);
        radio
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&DeviceRequest) -> Option<Result<DeviceResponse, String>> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Arc::new(f);
    }

    pub fn attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<DeviceRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self, pred: impl Fn(&DeviceRequest) -> bool) -> usize {
        self.sent.lock().unwrap().iter().filter(|r| pred(r)).count()
    }

    fn control(&self, msg: Control) -> bool {
        match self.control.lock().unwrap().as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Push an event as if the radio emitted it.
    pub fn emit(&self, event: DeviceEvent) -> bool {
        self.control(Control::Event(event))
    }

    /// Queue a message on the radio and announce it.
    pub fn deliver_waiting(&self, event: DeviceEvent) -> bool {
        self.waiting.lock().unwrap().push_back(event);
        self.control(Control::MessagesWaiting)
    }

    /// Have `event` arrive right before the radio answers its next request.
    pub fn emit_before_next_answer(&self, event: DeviceEvent) {
        self.preludes.lock().unwrap().push_back(event);
    }

    /// Simulate a pulled cable on the current link.
    pub fn drop_link(&self, reason: &str) -> bool {
        self.control(Control::Drop(reason.to_string()))
    }
}

pub struct MockConnector {
    radio: Arc<MockRadio>,
}

impl MockConnector {
    pub fn new(radio: Arc<MockRadio>) -> Arc<Self> {
        Arc::new(Self { radio })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _target: &TransportTarget) -> GatewayResult<Box<dyn DeviceLink>> {
        let radio = &self.radio;
        radio.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let refuse = radio
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if refuse {
            return Err(GatewayError::ConnectFailed("radio offline".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *radio.control.lock().unwrap() = Some(tx);
        let live = radio.live_links.fetch_add(1, Ordering::SeqCst) + 1;
        radio.max_live_links.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockLink {
            radio: radio.clone(),
            control: rx,
            answers: VecDeque::new(),
            open: true,
        }))
    }
}

pub struct MockLink {
    radio: Arc<MockRadio>,
    control: mpsc::UnboundedReceiver<Control>,
    answers: VecDeque<Inbound>,
    open: bool,
}

impl MockLink {
    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.radio.live_links.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl DeviceLink for MockLink {
    async fn self_info(&mut self) -> GatewayResult<SelfInfo> {
        Ok(sample_self_info())
    }

    async fn send(&mut self, id: RequestId, request: &DeviceRequest) -> GatewayResult<()> {
        if !self.open {
            return Err(GatewayError::transport("link closed"));
        }
        self.radio.sent.lock().unwrap().push(request.clone());
        let answer = if *request == DeviceRequest::SyncNextMessage {
            match self.radio.waiting.lock().unwrap().pop_front() {
                Some(event) => Some(Ok(DeviceResponse::Message(event))),
                None => Some(Ok(DeviceResponse::NoMoreMessages)),
            }
        } else {
            let responder = self.radio.responder.lock().unwrap().clone();
            responder(request)
        };
        if let Some(result) = answer {
            let preludes: Vec<_> = self.radio.preludes.lock().unwrap().drain(..).collect();
            self.answers
                .extend(preludes.into_iter().map(Inbound::Event));
            self.answers.push_back(Inbound::Response { id, result });
        }
        Ok(())
    }

    async fn recv(&mut self) -> GatewayResult<Inbound> {
        if let Some(answer) = self.answers.pop_front() {
            return Ok(answer);
        }
        match self.control.recv().await {
            Some(Control::Event(event)) => Ok(Inbound::Event(event)),
            Some(Control::MessagesWaiting) => Ok(Inbound::MessagesWaiting),
            Some(Control::Drop(reason)) => {
                self.release();
                Err(GatewayError::transport(reason))
            }
            None => Err(GatewayError::transport("radio gone")),
        }
    }

    async fn close(&mut self) -> GatewayResult<()> {
        self.release();
        Ok(())
    }

    fn describe(&self) -> String {
        "mock radio".to_string()
    }
}

/// Fast-retrying config pointed at the mock; health checks off.
pub fn test_config() -> DeviceConfig {
    DeviceConfig {
        tcp_host: "mock".to_string(),
        tcp_port: 5000,
        max_retries: 3,
        base_delay_secs: 5,
        max_delay_secs: 15,
        health_interval_secs: Some(0),
        ..DeviceConfig::default()
    }
}

pub struct Harness {
    pub radio: Arc<MockRadio>,
    pub manager: Arc<DeviceManager>,
    pub store: Arc<SqliteStore>,
    pub live: Arc<BroadcastSink>,
}

pub fn harness(radio: Arc<MockRadio>, config: DeviceConfig) -> Harness {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let live = Arc::new(BroadcastSink::new(64));
    let manager = Arc::new(DeviceManager::new(
        config,
        MockConnector::new(radio.clone()),
        store.clone(),
        live.clone(),
    ));
    Harness {
        radio,
        manager,
        store,
        live,
    }
}

/// Start a healthy harness and wait until it is connected.
pub async fn connected() -> Harness {
    let h = harness(MockRadio::new(), test_config());
    h.manager.start();
    assert!(wait_for(|| h.manager.is_connected()).await, "never connected");
    h
}

/// Poll `cond` every 10ms for up to 30s (virtual time under `start_paused`).
pub async fn wait_for<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..3000 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
