//! Request/response exchange over a [`Transport`].
//!
//! A [`Connection`] owns one background receive loop. Inbound datagrams are
//! routed two ways:
//!
//! - `TRAP_NOTIFY` packets are handed straight to the trap handler on their
//!   own task, so a slow callback never delays a response.
//! - everything else goes to a small bounded queue that the current
//!   [`exchange`](Connection::exchange) drains. When the queue is full the
//!   packet is dropped.
//!
//! Exchanges on one connection are serialized: each holds the queue for its
//! whole duration, so a response can only ever be claimed by the exchange
//! that is waiting for it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use super::Transport;
use crate::client::retry::{Retry, spread};
use crate::error::{Error, Result};
use crate::wire::{
    Command, HANDLE_MASK, Header, PROTOCOL_VERSION, STAY_AWAKE, decode_packet, encode_packet,
};

/// Responses buffered between the receive loop and the waiting exchange.
pub const RESPONSE_QUEUE_DEPTH: usize = 3;

/// Pause after a receive error before the loop polls the socket again.
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Handles one trap notification: the whole packet and its source.
pub type TrapHandler = Arc<dyn Fn(Bytes, SocketAddr) -> BoxFuture<'static, ()> + Send + Sync>;

/// Parameters of one [`Connection::exchange`].
#[derive(Debug, Clone, Copy)]
pub struct Exchange<'a> {
    pub target: SocketAddr,
    pub command: Command,
    pub body: &'a [u8],
    /// Command a matching response carries.
    pub expect: Command,
    /// Ask a sleeping node to stay awake for a follow-up request.
    pub stay_awake: bool,
    /// Wait per send.
    pub timeout: Duration,
    pub retry: &'a Retry,
}

/// Shared state of a connection.
struct ConnectionInner<T: Transport> {
    transport: T,
    responses: tokio::sync::Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
    handle: AtomicU8,
    cancel: CancellationToken,
    traps: TaskTracker,
}

/// Exchange engine over a transport.
///
/// Cheap to clone; clones share the receive loop.
pub struct Connection<T: Transport> {
    inner: Arc<ConnectionInner<T>>,
}

impl<T: Transport> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Connection<T> {
    /// Start the receive loop.
    ///
    /// At most `max_trap_tasks` trap notifications are handled at once;
    /// notifications beyond that are dropped.
    pub fn start(transport: T, on_trap: TrapHandler, max_trap_tasks: usize) -> Self {
        let (queue, responses) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let traps = TaskTracker::new();

        let receiver = ReceiveLoop {
            transport: transport.clone(),
            queue,
            on_trap,
            traps: traps.clone(),
            max_trap_tasks,
            cancel: cancel.clone(),
        };
        tokio::spawn(receiver.run());

        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                responses: tokio::sync::Mutex::new(responses),
                handle: AtomicU8::new(0),
                cancel,
                traps,
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    /// Next value of the 7-bit rolling handle.
    fn next_handle(&self) -> u8 {
        let previous = self
            .inner
            .handle
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |h| {
                Some(h.wrapping_add(1) & HANDLE_MASK)
            })
            .unwrap_or_default();
        previous.wrapping_add(1) & HANDLE_MASK
    }

    /// Send a request and wait for its response.
    ///
    /// A response is accepted when its version, command and handle all match
    /// and it comes from `target` (any source when `target` is
    /// unspecified). Anything else is discarded and the wait continues.
    /// After `timeout` without a match the request is sent again, up to
    /// [`Retry::total_sends`] times.
    ///
    /// Returns the response body and its source.
    #[instrument(
        level = "debug",
        skip(self, exchange),
        fields(
            jip.target = %exchange.target,
            jip.command = %exchange.command,
            jip.handle = tracing::field::Empty,
            jip.sends = tracing::field::Empty,
        )
    )]
    pub async fn exchange(&self, exchange: Exchange<'_>) -> Result<(Bytes, SocketAddr)> {
        let mut responses = self.inner.responses.lock().await;
        // Leftovers belong to exchanges that already gave up.
        while responses.try_recv().is_ok() {}

        let mut handle = self.next_handle();
        if exchange.stay_awake {
            handle |= STAY_AWAKE;
        }
        tracing::Span::current().record("jip.handle", handle);
        let packet = encode_packet(Header::new(exchange.command, handle), exchange.body);

        let started = Instant::now();
        let total_sends = exchange.retry.total_sends();
        for attempt in 0..total_sends {
            if attempt > 0 {
                let delay = exchange.retry.compute_delay(attempt - 1);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            tracing::Span::current().record("jip.sends", attempt + 1);

            if let Err(e) = self.inner.transport.send_to(&packet, exchange.target).await {
                tracing::debug!(target: "async_jip::transport", { error = %e, jip.attempt = attempt }, "send failed");
                continue;
            }

            let deadline = Instant::now() + exchange.timeout;
            loop {
                let (data, source) =
                    match tokio::time::timeout_at(deadline, responses.recv()).await {
                        Err(_) => break,
                        Ok(Some(received)) => received,
                        Ok(None) => {
                            return Err(Error::Network {
                                target: exchange.target,
                                source: std::io::Error::from(std::io::ErrorKind::NotConnected),
                            }
                            .boxed());
                        }
                    };
                if let Some(body) = accept(&exchange, handle, data, source) {
                    return Ok((body, source));
                }
            }
            tracing::trace!(target: "async_jip::transport", { jip.attempt = attempt }, "attempt timed out");
        }

        tracing::debug!(
            target: "async_jip::transport",
            { jip.target = %exchange.target, jip.sends = total_sends },
            "exchange timed out"
        );
        Err(Error::Timeout {
            target: exchange.target,
            elapsed: started.elapsed(),
            retries: total_sends,
        }
        .boxed())
    }

    /// Send without waiting for anything.
    ///
    /// Used for multicast requests, which nobody answers. The handle is
    /// arbitrary.
    pub async fn send(&self, target: SocketAddr, command: Command, body: &[u8]) -> Result<()> {
        let handle = (spread() >> 57) as u8 & HANDLE_MASK;
        let packet = encode_packet(Header::new(command, handle), body);
        self.inner.transport.send_to(&packet, target).await
    }

    /// Stop the receive loop and wait for running trap handlers.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.traps.close();
        self.inner.traps.wait().await;
    }

    /// Trap handlers currently running.
    pub fn active_traps(&self) -> usize {
        self.inner.traps.len()
    }
}

/// Match one inbound packet against the exchange in flight.
fn accept(exchange: &Exchange<'_>, handle: u8, data: Bytes, source: SocketAddr) -> Option<Bytes> {
    if !exchange.target.ip().is_unspecified() && source.ip() != exchange.target.ip() {
        tracing::debug!(
            target: "async_jip::transport",
            { jip.source = %source, jip.target = %exchange.target },
            "discarding response from unexpected source"
        );
        return None;
    }
    let (header, body) = decode_packet(data, source).ok()?;
    if header.command != exchange.expect {
        tracing::debug!(
            target: "async_jip::transport",
            { jip.command = %header.command, jip.expect = %exchange.expect },
            "discarding response with unexpected command"
        );
        return None;
    }
    if header.handle != handle {
        tracing::debug!(
            target: "async_jip::transport",
            { jip.handle = header.handle, jip.expect_handle = handle },
            "discarding response with stale handle"
        );
        return None;
    }
    Some(body)
}

struct ReceiveLoop<T: Transport> {
    transport: T,
    queue: mpsc::Sender<(Bytes, SocketAddr)>,
    on_trap: TrapHandler,
    traps: TaskTracker,
    max_trap_tasks: usize,
    cancel: CancellationToken,
}

impl<T: Transport> ReceiveLoop<T> {
    async fn run(self) {
        tracing::debug!(target: "async_jip::transport", { jip.local_addr = %self.transport.local_addr() }, "receive loop started");
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.transport.recv_from() => received,
            };
            match received {
                Ok((data, source)) => self.route(data, source),
                Err(e) => {
                    tracing::warn!(target: "async_jip::transport", { error = %e }, "receive failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECV_ERROR_PAUSE) => {}
                    }
                }
            }
        }
        tracing::debug!(target: "async_jip::transport", "receive loop stopped");
    }

    fn route(&self, data: Bytes, source: SocketAddr) {
        if data.len() < Header::LEN || data[0] != PROTOCOL_VERSION {
            tracing::debug!(target: "async_jip::transport", { jip.source = %source, jip.bytes = data.len() }, "dropping packet with bad header");
            return;
        }
        if data[1] == Command::TrapNotify.as_u8() {
            if self.traps.len() >= self.max_trap_tasks {
                tracing::warn!(target: "async_jip::transport", { jip.source = %source }, "too many trap handlers running, dropping notification");
                return;
            }
            self.traps.spawn((self.on_trap)(data, source));
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = self.queue.try_send((data, source)) {
            tracing::debug!(target: "async_jip::transport", { jip.source = %source }, "response queue full, dropping packet");
        }
    }
}
