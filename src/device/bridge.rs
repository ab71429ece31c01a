//! Hands commands from any number of callers to the single driver task.
//!
//! Each connection gets a fresh submission queue. The bridge holds its sender
//! only while the connection is live, so a call against a dead or absent
//! connection fails immediately with [`GatewayError::NotConnected`].

use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::commands::{CommandTimeouts, DeviceRequest, DeviceResponse, RequestId};
use crate::error::{GatewayError, GatewayResult};
use crate::metrics;

pub(crate) type Reply = oneshot::Sender<GatewayResult<DeviceResponse>>;

/// Who is waiting on a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Caller,
    /// Pull of the device's waiting-message queue.
    Sync,
    Health,
}

/// A queued or in-flight command. Completing it consumes the reply channel,
/// so a caller hears about it at most once.
pub(crate) struct PendingCommand {
    pub id: RequestId,
    pub request: DeviceRequest,
    pub timeout: Duration,
    pub deadline: Instant,
    pub origin: Origin,
    reply: Option<Reply>,
}

impl PendingCommand {
    pub fn internal(id: RequestId, request: DeviceRequest, timeout: Duration, origin: Origin) -> Self {
        Self {
            id,
            request,
            timeout,
            deadline: Instant::now() + timeout,
            origin,
            reply: None,
        }
    }

    /// The caller stopped waiting (timed out or was dropped).
    pub fn is_abandoned(&self) -> bool {
        self.reply.as_ref().map(|r| r.is_closed()).unwrap_or(false)
    }

    pub fn complete(mut self, result: GatewayResult<DeviceResponse>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }

    pub fn timeout_error(&self) -> GatewayError {
        GatewayError::Timeout {
            command: self.request.name(),
            after: self.timeout,
        }
    }
}

pub struct CommandBridge {
    submit: RwLock<Option<mpsc::UnboundedSender<PendingCommand>>>,
    next_id: AtomicU64,
    timeouts: CommandTimeouts,
    runtime: Option<Handle>,
}

impl CommandBridge {
    pub fn new(timeouts: CommandTimeouts) -> Self {
        Self {
            submit: RwLock::new(None),
            next_id: AtomicU64::new(1),
            timeouts,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn timeouts(&self) -> CommandTimeouts {
        self.timeouts
    }

    pub fn is_attached(&self) -> bool {
        self.submit
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn allocate_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Install the submission queue of a freshly connected session.
    pub(crate) fn attach(&self) -> mpsc::UnboundedReceiver<PendingCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.submit.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    pub(crate) fn detach(&self) {
        self.submit
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Run a command with its default timeout.
    pub async fn call(&self, request: DeviceRequest) -> GatewayResult<DeviceResponse> {
        let timeout = request.default_timeout(&self.timeouts);
        self.execute(request, timeout).await
    }

    /// Queue `request` on the live connection and wait for its outcome.
    ///
    /// Exactly one of: the device response, `Timeout`, `DisconnectedMidFlight`
    /// (or `NotConnected` when there is no connection to queue on).
    pub async fn execute(
        &self,
        request: DeviceRequest,
        timeout: Duration,
    ) -> GatewayResult<DeviceResponse> {
        let sender = self
            .submit
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(GatewayError::NotConnected)?;

        let id = self.allocate_id();
        let command = request.name();
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        sender
            .send(PendingCommand {
                id,
                request,
                timeout,
                deadline,
                origin: Origin::Caller,
                reply: Some(tx),
            })
            .map_err(|_| GatewayError::NotConnected)?;

        let result = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::DisconnectedMidFlight),
            Err(_) => Err(GatewayError::Timeout {
                command,
                after: timeout,
            }),
        };
        match &result {
            Ok(_) => metrics::inc_commands_ok(),
            Err(GatewayError::Timeout { .. }) => {
                debug!("Command {} (id {}) timed out", command, id);
                metrics::inc_commands_timed_out();
            }
            Err(_) => metrics::inc_commands_failed(),
        }
        result
    }

    /// [`execute`](Self::execute) for callers on plain threads outside the runtime.
    pub fn execute_blocking(
        &self,
        request: DeviceRequest,
        timeout: Duration,
    ) -> GatewayResult<DeviceResponse> {
        let handle = self
            .runtime
            .clone()
            .ok_or_else(|| GatewayError::transport("no async runtime available for blocking call"))?;
        handle.block_on(self.execute(request, timeout))
    }
}
