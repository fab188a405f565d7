//! Collaborator drivers.
//!
//! A driver is an out-of-sandbox service (clock, database, HTTP, UI bridge)
//! that modules reach by sending to its mailbox.  The kernel gives each
//! driver a pid and a mailbox named after [`Driver::name`], so reaching it
//! requires a `messaging:send:<name>` capability like any other endpoint.
//! Replies go back through the router with `REPLY | DRIVER` set.  A failed
//! request is answered too, with a [`MessageKind::Error`] reply carrying the
//! driver's error.

use std::sync::Arc;

use async_trait::async_trait;
use esta_ipc::Router;
use esta_kernel::Clock;
use esta_types::{EstaError, Message, MessageFlags, MessageKind, ProcessId};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Every collaborator driver implements this trait.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Mailbox name, e.g. `driver.clock`.
    fn name(&self) -> &str;

    /// Handle one request and produce the reply payload.
    async fn handle(&self, request: &Message) -> Result<Vec<u8>, EstaError>;
}

/// Answers any request with `Pong ‖ now_ms (u64 LE)`.
pub struct ClockDriver {
    clock: Arc<dyn Clock>,
}

impl ClockDriver {
    pub const NAME: &'static str = "driver.clock";

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Driver for ClockDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle(&self, _request: &Message) -> Result<Vec<u8>, EstaError> {
        let mut payload = Vec::with_capacity(9);
        payload.push(MessageKind::Pong.code());
        payload.extend_from_slice(&self.clock.now_ms().to_le_bytes());
        Ok(payload)
    }
}

/// Decode a [`ClockDriver`] reply.
pub fn clock_reading(reply: &Message) -> Option<u64> {
    if reply.kind() != Some(MessageKind::Pong) {
        return None;
    }
    let raw: [u8; 8] = reply.body().try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

// ────────────────────────────────────────────────────────────────────────────

async fn answer(router: &Router, pid: ProcessId, driver: &dyn Driver, request: Message) {
    let reply = match driver.handle(&request).await {
        Ok(payload) => Message::new(pid, request.source, request.priority, payload),
        Err(err) => {
            warn!(driver = driver.name(), from = %request.source, %err, "driver request failed");
            match Message::error_reply(pid, request.source, request.priority, &err) {
                Ok(reply) => reply,
                Err(encode_err) => {
                    warn!(driver = driver.name(), err = %encode_err, "driver error not encoded");
                    return;
                }
            }
        }
    };
    let reply = reply.with_flags(MessageFlags::REPLY | MessageFlags::DRIVER);
    if let Err(err) = router.send(reply) {
        warn!(driver = driver.name(), to = %request.source, %err, "driver reply refused");
    }
}

/// Answer everything currently queued for the driver at `pid`.
pub async fn serve_pending(
    router: &Router,
    pid: ProcessId,
    driver: &dyn Driver,
) -> Result<usize, EstaError> {
    let mut served = 0;
    while let Some(request) = router.receive(pid)? {
        answer(router, pid, driver, request).await;
        served += 1;
    }
    Ok(served)
}

/// Serve the driver's mailbox until it is closed.
pub fn spawn_driver(router: Arc<Router>, pid: ProcessId, driver: Arc<dyn Driver>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match router.recv(pid).await {
                Ok(request) => answer(&router, pid, driver.as_ref(), request).await,
                Err(err) => {
                    debug!(driver = driver.name(), %err, "driver loop stopped");
                    break;
                }
            }
        }
    })
}
