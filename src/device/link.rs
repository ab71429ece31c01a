//! The transport seam: how the driver opens and talks to a radio.
//!
//! The driver only sees these traits. [`super::companion`] implements them
//! for real hardware; tests drive the manager with scripted links.

use async_trait::async_trait;
use std::fmt;

use super::commands::{DeviceRequest, DeviceResponse, RequestId};
use super::events::DeviceEvent;
use super::types::SelfInfo;
use crate::error::{GatewayError, GatewayResult};

/// Where to find the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportTarget {
    /// `port: None` probes candidate USB serial devices.
    Serial { port: Option<String>, baud_rate: u32 },
    Tcp { host: String, port: u16 },
}

impl TransportTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportTarget::Serial { .. } => "serial",
            TransportTarget::Tcp { .. } => "tcp",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TransportTarget::Serial {
                port: Some(p),
                baud_rate,
            } => format!("serial {} @ {}", p, baud_rate),
            TransportTarget::Serial {
                port: None,
                baud_rate,
            } => format!("serial (auto) @ {}", baud_rate),
            TransportTarget::Tcp { host, port } => format!("tcp {}:{}", host, port),
        }
    }
}

impl fmt::Display for TransportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// One item read off a live link.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Answer to the request written with `id`. `Err` carries the device's
    /// own error text.
    Response {
        id: RequestId,
        result: Result<DeviceResponse, String>,
    },
    Event(DeviceEvent),
    /// The device has queued messages for us to pull.
    MessagesWaiting,
}

/// A live, exclusively owned connection to the radio.
///
/// `recv` must be cancel safe: the driver polls it inside `select!` and drops
/// the future whenever another branch wins.
#[async_trait]
pub trait DeviceLink: Send {
    /// Start the app session and read the device identity. Events that
    /// arrive meanwhile are held and returned by later `recv` calls.
    async fn self_info(&mut self) -> GatewayResult<SelfInfo>;

    /// Write one request. The link remembers `id` so the matching response
    /// comes back tagged with it.
    async fn send(&mut self, id: RequestId, request: &DeviceRequest) -> GatewayResult<()>;

    /// Next response, event or notification. An error means the link is gone.
    async fn recv(&mut self) -> GatewayResult<Inbound>;

    async fn close(&mut self) -> GatewayResult<()>;

    fn describe(&self) -> String;
}

/// Opens links. Connectors never retry on their own; the manager does.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &TransportTarget) -> GatewayResult<Box<dyn DeviceLink>>;
}

/// Pick the serial device to open.
///
/// A configured port always wins. Otherwise exactly one candidate must exist;
/// none or several is an error naming what was found.
pub fn resolve_serial_port(
    configured: Option<&str>,
    candidates: &[String],
) -> GatewayResult<String> {
    if let Some(port) = configured.map(str::trim).filter(|p| !p.is_empty()) {
        return Ok(port.to_string());
    }
    match candidates {
        [] => Err(GatewayError::ConnectFailed(
            "no serial port configured and no USB serial devices found".to_string(),
        )),
        [only] => Ok(only.clone()),
        many => Err(GatewayError::ConnectFailed(format!(
            "no serial port configured and {} candidates found ({}); set serial_port",
            many.len(),
            many.join(", ")
        ))),
    }
}

/// USB serial devices that look like a companion radio.
#[cfg(feature = "serial")]
pub fn candidate_serial_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .filter(|p| {
                matches!(p.port_type, serialport::SerialPortType::UsbPort(_))
                    || p.port_name.contains("ttyUSB")
                    || p.port_name.contains("ttyACM")
            })
            .map(|p| p.port_name)
            .collect(),
        Err(e) => {
            log::warn!("Unable to enumerate serial ports: {}", e);
            Vec::new()
        }
    }
}

#[cfg(not(feature = "serial"))]
pub fn candidate_serial_ports() -> Vec<String> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_port_wins() {
        let found = vec!["/dev/ttyACM0".to_string()];
        assert_eq!(
            resolve_serial_port(Some("/dev/ttyUSB3"), &found).unwrap(),
            "/dev/ttyUSB3"
        );
    }

    #[test]
    fn single_candidate_is_used() {
        let found = vec!["/dev/ttyACM0".to_string()];
        assert_eq!(resolve_serial_port(None, &found).unwrap(), "/dev/ttyACM0");
        assert_eq!(resolve_serial_port(Some("  "), &found).unwrap(), "/dev/ttyACM0");
    }

    #[test]
    fn zero_or_many_candidates_fail_descriptively() {
        let err = resolve_serial_port(None, &[]).unwrap_err().to_string();
        assert!(err.contains("no USB serial devices"), "{}", err);

        let found = vec!["/dev/ttyUSB0".to_string(), "/dev/ttyACM0".to_string()];
        let err = resolve_serial_port(None, &found).unwrap_err().to_string();
        assert!(err.contains("2 candidates"), "{}", err);
        assert!(err.contains("/dev/ttyACM0"), "{}", err);
    }

    #[test]
    fn targets_describe_themselves() {
        let tcp = TransportTarget::Tcp {
            host: "10.0.0.5".into(),
            port: 5000,
        };
        assert_eq!(tcp.to_string(), "tcp 10.0.0.5:5000");
        assert_eq!(tcp.kind(), "tcp");
        let auto = TransportTarget::Serial {
            port: None,
            baud_rate: 115200,
        };
        assert_eq!(auto.describe(), "serial (auto) @ 115200");
    }
}
