//! Companion-protocol link over serial or TCP.
//!
//! A pump (a blocking thread for serial, a task for TCP) copies raw bytes into
//! an unbounded channel. The link owns the framer and turns frames into
//! [`Inbound`] items, matching responses to the one request in flight.

use async_trait::async_trait;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use super::codec::{self, Decoded, FrameError};
use super::commands::{DeviceRequest, DeviceResponse, RequestId};
use super::framer::{encode_frame, CompanionFramer};
use super::link::{Connector, DeviceLink, Inbound, TransportTarget};
use super::types::{DeviceContact, SelfInfo};
use crate::error::{GatewayError, GatewayResult};
use crate::logutil::hex_snippet;
use crate::metrics;

#[cfg(feature = "serial")]
use serialport::SerialPort;
#[cfg(feature = "serial")]
use std::io::{Read, Write};
#[cfg(feature = "serial")]
use std::sync::{Arc, Mutex};

/// Request id used for the session handshake; bridge ids start at 1.
const HANDSHAKE_ID: RequestId = 0;

/// Opens [`CompanionLink`]s for the configured transport.
#[derive(Debug, Clone)]
pub struct CompanionConnector {
    connect_timeout: Duration,
}

impl CompanionConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for CompanionConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl Connector for CompanionConnector {
    async fn connect(&self, target: &TransportTarget) -> GatewayResult<Box<dyn DeviceLink>> {
        let link = match target {
            TransportTarget::Tcp { host, port } => {
                open_tcp(host, *port, self.connect_timeout).await?
            }
            TransportTarget::Serial { port, baud_rate } => {
                open_serial(port.as_deref(), *baud_rate, self.connect_timeout).await?
            }
        };
        Ok(Box::new(link))
    }
}

async fn open_tcp(host: &str, port: u16, limit: Duration) -> GatewayResult<CompanionLink> {
    let stream = tokio::time::timeout(limit, TcpStream::connect((host, port)))
        .await
        .map_err(|_| GatewayError::ConnectFailed(format!("timed out connecting to {}:{}", host, port)))?
        .map_err(|e| GatewayError::ConnectFailed(format!("{}:{}: {}", host, port, e)))?;
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let pump = spawn_tcp_pump(read, tx);
    debug!("TCP link to {}:{} established", host, port);
    Ok(CompanionLink::new(
        FrameSink::Tcp(write),
        rx,
        Some(pump),
        format!("tcp {}:{}", host, port),
        limit,
    ))
}

fn spawn_tcp_pump(mut read: OwnedReadHalf, tx: mpsc::UnboundedSender<Vec<u8>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1024];
        loop {
            match read.read(&mut buf).await {
                Ok(0) => {
                    debug!("TCP peer closed the connection");
                    break;
                }
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("TCP read error: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(feature = "serial")]
async fn open_serial(
    port: Option<&str>,
    baud_rate: u32,
    limit: Duration,
) -> GatewayResult<CompanionLink> {
    let candidates = if port.is_some() {
        Vec::new()
    } else {
        super::link::candidate_serial_ports()
    };
    let port_name = super::link::resolve_serial_port(port, &candidates)?;
    let name = port_name.clone();
    let opened = tokio::task::spawn_blocking(move || open_serial_blocking(&name, baud_rate))
        .await
        .map_err(|e| GatewayError::ConnectFailed(format!("serial open task failed: {}", e)))??;

    let reader = opened
        .try_clone()
        .map_err(|e| GatewayError::ConnectFailed(format!("cannot clone {}: {}", port_name, e)))?;
    let (tx, rx) = mpsc::unbounded_channel();
    spawn_serial_pump(reader, tx, port_name.clone());
    Ok(CompanionLink::new(
        FrameSink::Serial(Arc::new(Mutex::new(opened))),
        rx,
        None,
        format!("serial {} @ {}", port_name, baud_rate),
        limit,
    ))
}

#[cfg(not(feature = "serial"))]
async fn open_serial(
    _port: Option<&str>,
    _baud_rate: u32,
    _limit: Duration,
) -> GatewayResult<CompanionLink> {
    Err(GatewayError::ConnectFailed(
        "serial support not compiled in (enable the 'serial' feature)".to_string(),
    ))
}

#[cfg(feature = "serial")]
fn open_serial_blocking(port_name: &str, baud_rate: u32) -> GatewayResult<Box<dyn SerialPort>> {
    let mut builder = serialport::new(port_name, baud_rate).timeout(Duration::from_millis(100));
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder.open().map_err(|e| {
        GatewayError::ConnectFailed(format!("failed to open serial port {}: {}", port_name, e))
    })?;

    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(false);
    std::thread::sleep(Duration::from_millis(150));
    // Drop boot chatter buffered before we attached.
    let _ = port.clear(serialport::ClearBuffer::Input);

    debug!("Serial port {} opened at {} baud", port_name, baud_rate);
    Ok(port)
}

#[cfg(feature = "serial")]
fn spawn_serial_pump(
    mut port: Box<dyn SerialPort>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    port_name: String,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 512];
        while !tx.is_closed() {
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("Serial read error on {}: {}", port_name, e);
                    break;
                }
            }
        }
        debug!("Serial pump for {} stopped", port_name);
    });
}

enum FrameSink {
    Tcp(OwnedWriteHalf),
    #[cfg(feature = "serial")]
    Serial(Arc<Mutex<Box<dyn SerialPort>>>),
}

impl FrameSink {
    async fn write(&mut self, bytes: Vec<u8>) -> GatewayResult<()> {
        match self {
            FrameSink::Tcp(w) => {
                w.write_all(&bytes).await?;
                w.flush().await?;
                Ok(())
            }
            #[cfg(feature = "serial")]
            FrameSink::Serial(port) => {
                let port = port.clone();
                tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    let mut guard = port.lock().map_err(|_| {
                        std::io::Error::new(std::io::ErrorKind::Other, "serial port lock poisoned")
                    })?;
                    guard.write_all(&bytes)?;
                    guard.flush()
                })
                .await
                .map_err(|e| GatewayError::transport(format!("serial write task failed: {}", e)))??;
                Ok(())
            }
        }
    }

    async fn shutdown(&mut self) -> GatewayResult<()> {
        match self {
            FrameSink::Tcp(w) => {
                w.shutdown().await?;
                Ok(())
            }
            #[cfg(feature = "serial")]
            FrameSink::Serial(_) => Ok(()),
        }
    }
}

struct Outstanding {
    id: RequestId,
    request: DeviceRequest,
}

pub struct CompanionLink {
    sink: FrameSink,
    bytes_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    framer: CompanionFramer,
    outstanding: Option<Outstanding>,
    contacts: Option<Vec<DeviceContact>>,
    held: VecDeque<Inbound>,
    pump: Option<JoinHandle<()>>,
    description: String,
    handshake_timeout: Duration,
}

impl CompanionLink {
    fn new(
        sink: FrameSink,
        bytes_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        pump: Option<JoinHandle<()>>,
        description: String,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            sink,
            bytes_rx,
            framer: CompanionFramer::new(),
            outstanding: None,
            contacts: None,
            held: VecDeque::new(),
            pump,
            description,
            handshake_timeout,
        }
    }

    async fn next_inbound(&mut self) -> GatewayResult<Inbound> {
        loop {
            while let Some(frame) = self.framer.next_frame() {
                if let Some(inbound) = self.interpret(&frame) {
                    return Ok(inbound);
                }
            }
            match self.bytes_rx.recv().await {
                Some(chunk) => self.framer.push(&chunk),
                None => {
                    return Err(GatewayError::transport(format!(
                        "{} closed",
                        self.description
                    )))
                }
            }
        }
    }

    fn interpret(&mut self, frame: &[u8]) -> Option<Inbound> {
        let decoded = match codec::decode(frame) {
            Ok(d) => d,
            Err(e) => {
                metrics::inc_malformed_frames();
                let kind = match &e {
                    FrameError::Truncated { what, .. } => *what,
                    FrameError::Empty => "empty",
                };
                let err = GatewayError::MalformedEvent {
                    kind,
                    reason: e.to_string(),
                };
                warn!("{} on {} [{}]", err, self.description, hex_snippet(frame, 24));
                return None;
            }
        };
        match decoded {
            Decoded::Push(event) => Some(Inbound::Event(event)),
            Decoded::MessagesWaiting => Some(Inbound::MessagesWaiting),
            Decoded::Unknown(code) => {
                trace!("Ignoring frame code 0x{:02x} on {}", code, self.description);
                None
            }
            response => self.correlate(frame[0], response),
        }
    }

    fn correlate(&mut self, code: u8, decoded: Decoded) -> Option<Inbound> {
        let expected = self
            .outstanding
            .as_ref()
            .map(|o| codec::answers(&o.request, code));
        if expected != Some(true) {
            // A message pulled by a request that already expired still carries data.
            if let Decoded::Message(event) = decoded {
                return Some(Inbound::Event(event));
            }
            metrics::inc_late_responses();
            debug!(
                "Discarding response code {} on {} (waiting on {})",
                code,
                self.description,
                self.outstanding
                    .as_ref()
                    .map(|o| o.request.name())
                    .unwrap_or("nothing")
            );
            return None;
        }

        let result = match decoded {
            Decoded::Err(c) => {
                self.contacts = None;
                Err(codec::error_text(c))
            }
            Decoded::ContactsStart(_) => {
                self.contacts = Some(Vec::new());
                return None;
            }
            Decoded::Contact(contact) => {
                self.contacts.get_or_insert_with(Vec::new).push(contact);
                return None;
            }
            Decoded::EndOfContacts(_) => {
                Ok(DeviceResponse::Contacts(self.contacts.take().unwrap_or_default()))
            }
            Decoded::Ok => Ok(DeviceResponse::Ok),
            Decoded::SelfInfo(info) => Ok(DeviceResponse::SelfInfo(info)),
            Decoded::Sent(sent) => Ok(DeviceResponse::Sent(sent)),
            Decoded::Message(event) => Ok(DeviceResponse::Message(event)),
            Decoded::CurrentTime(t) => Ok(DeviceResponse::CurrentTime(t)),
            Decoded::NoMoreMessages => Ok(DeviceResponse::NoMoreMessages),
            Decoded::Battery(b) => Ok(DeviceResponse::Battery(b)),
            Decoded::DeviceInfo(d) => Ok(DeviceResponse::DeviceInfo(d)),
            Decoded::Channel(c) => Ok(DeviceResponse::Channel(c)),
            Decoded::Push(_) | Decoded::MessagesWaiting | Decoded::Unknown(_) => return None,
        };
        let done = self.outstanding.take()?;
        Some(Inbound::Response {
            id: done.id,
            result,
        })
    }
}

#[async_trait]
impl DeviceLink for CompanionLink {
    async fn self_info(&mut self) -> GatewayResult<SelfInfo> {
        self.send(HANDSHAKE_ID, &DeviceRequest::AppStart).await?;
        let limit = self.handshake_timeout;
        let deadline = Instant::now() + limit;
        loop {
            let inbound = timeout_at(deadline, self.next_inbound())
                .await
                .map_err(|_| GatewayError::Timeout {
                    command: "app_start",
                    after: limit,
                })??;
            match inbound {
                Inbound::Response {
                    id: HANDSHAKE_ID,
                    result: Ok(DeviceResponse::SelfInfo(info)),
                } => return Ok(info),
                Inbound::Response {
                    id: HANDSHAKE_ID,
                    result: Err(e),
                } => return Err(GatewayError::DeviceRejected(e)),
                Inbound::Response { .. } => {}
                other => self.held.push_back(other),
            }
        }
    }

    async fn send(&mut self, id: RequestId, request: &DeviceRequest) -> GatewayResult<()> {
        self.outstanding = Some(Outstanding {
            id,
            request: request.clone(),
        });
        self.contacts = None;
        let frame = encode_frame(&codec::encode(request));
        trace!(
            "-> {} {} [{}]",
            self.description,
            request.name(),
            hex_snippet(&frame, 24)
        );
        self.sink.write(frame).await
    }

    async fn recv(&mut self) -> GatewayResult<Inbound> {
        if let Some(held) = self.held.pop_front() {
            return Ok(held);
        }
        self.next_inbound().await
    }

    async fn close(&mut self) -> GatewayResult<()> {
        self.bytes_rx.close();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.sink.shutdown().await
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

impl Drop for CompanionLink {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::codec::{push, resp, tests::contact_record};
    use crate::device::events::DeviceEvent;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn inbound_frame(payload: &[u8]) -> Vec<u8> {
        let mut v = vec![b'>'];
        v.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        v.extend_from_slice(payload);
        v
    }

    fn self_info_payload() -> Vec<u8> {
        let mut v = vec![resp::SELF_INFO, 1, 20, 22];
        v.extend_from_slice(&[0x5a; 32]);
        v.extend_from_slice(&[0u8; 8]);
        v.extend_from_slice(&[0, 0, 0, 0]);
        v.extend_from_slice(&869_525u32.to_le_bytes());
        v.extend_from_slice(&250_000u32.to_le_bytes());
        v.extend_from_slice(&[11, 5]);
        v.extend_from_slice(b"Gate");
        v
    }

    /// Reads one outbound frame from the fake radio side.
    async fn read_request(sock: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 3];
        sock.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], b'<');
        let len = u16::from_le_bytes([header[1], header[2]]) as usize;
        let mut body = vec![0u8; len];
        sock.read_exact(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn tcp_link_handshake_and_contacts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let radio = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let req = read_request(&mut sock).await;
            assert_eq!(req[0], codec::cmd::APP_START);
            // An advert racing the handshake must not be lost.
            let mut advert = vec![push::ADVERT];
            advert.extend_from_slice(&[0x77; 32]);
            sock.write_all(&inbound_frame(&advert)).await.unwrap();
            sock.write_all(&inbound_frame(&self_info_payload())).await.unwrap();

            let req = read_request(&mut sock).await;
            assert_eq!(req[0], codec::cmd::GET_CONTACTS);
            let mut start = vec![resp::CONTACTS_START];
            start.extend_from_slice(&1u32.to_le_bytes());
            sock.write_all(&inbound_frame(&start)).await.unwrap();
            let mut contact = vec![resp::CONTACT];
            contact.extend(contact_record(0x33, "Hilltop"));
            sock.write_all(&inbound_frame(&contact)).await.unwrap();
            let mut end = vec![resp::END_OF_CONTACTS];
            end.extend_from_slice(&0u32.to_le_bytes());
            sock.write_all(&inbound_frame(&end)).await.unwrap();
            sock
        });

        let connector = CompanionConnector::new(Duration::from_secs(5));
        let target = TransportTarget::Tcp {
            host: addr.ip().to_string(),
            port: addr.port(),
        };
        let mut link = connector.connect(&target).await.unwrap();
        let info = link.self_info().await.unwrap();
        assert_eq!(info.name, "Gate");

        link.send(7, &DeviceRequest::GetContacts).await.unwrap();
        match link.recv().await.unwrap() {
            Inbound::Event(DeviceEvent::Advertisement(a)) => {
                assert_eq!(a.public_key, "77".repeat(32))
            }
            other => panic!("expected held advert, got {:?}", other),
        }
        match link.recv().await.unwrap() {
            Inbound::Response {
                id: 7,
                result: Ok(DeviceResponse::Contacts(list)),
            } => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].name, "Hilltop");
            }
            other => panic!("expected contacts, got {:?}", other),
        }

        let sock = radio.await.unwrap();
        drop(sock);
        assert!(link.recv().await.is_err());
        link.close().await.ok();
    }

    #[tokio::test]
    async fn unmatched_responses_are_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let radio = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut sock).await;
            // A stale battery answer, then the real one for the channel query.
            let mut battery = vec![resp::BATTERY];
            battery.extend_from_slice(&3900u16.to_le_bytes());
            sock.write_all(&inbound_frame(&battery)).await.unwrap();
            let mut chan = vec![resp::CHANNEL_INFO, 0];
            chan.extend_from_slice(b"Public");
            chan.extend_from_slice(&[0u8; 26]);
            chan.extend_from_slice(&[0x8b; 16]);
            sock.write_all(&inbound_frame(&chan)).await.unwrap();
            sock
        });

        let connector = CompanionConnector::default();
        let target = TransportTarget::Tcp {
            host: addr.ip().to_string(),
            port: addr.port(),
        };
        let mut link = connector.connect(&target).await.unwrap();
        link.send(3, &DeviceRequest::GetChannel(0)).await.unwrap();
        match link.recv().await.unwrap() {
            Inbound::Response {
                id: 3,
                result: Ok(DeviceResponse::Channel(c)),
            } => assert_eq!(c.name, "Public"),
            other => panic!("expected channel info, got {:?}", other),
        }
        let _sock = radio.await.unwrap();
    }
}
