//! Mock transport for testing.
//!
//! Provides a programmable transport that can simulate nodes without a
//! socket. Responses are either queued one per request or produced by a
//! responder closure.

use std::collections::VecDeque;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::Transport;
use crate::error::{Error, Result};

/// A mock response to return for a request.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return this data from the request's target, with the handle byte
    /// patched to match the request.
    Data(Bytes),
    /// Like `Data`, but from another source address.
    DataFrom(Bytes, SocketAddr),
    /// Return this data as-is without patching the handle.
    RawData(Bytes),
    /// Drop the request.
    Timeout,
}

/// Produces the datagrams a request provokes, as `(data, source)` pairs.
pub type Responder = Arc<dyn Fn(&[u8], SocketAddr) -> Vec<(Bytes, SocketAddr)> + Send + Sync>;

/// A recorded request sent through the mock transport.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub data: Bytes,
    pub target: SocketAddr,
}

impl RecordedRequest {
    /// Command byte of the request.
    pub fn command(&self) -> Option<u8> {
        self.data.get(1).copied()
    }

    /// Handle byte of the request.
    pub fn handle(&self) -> Option<u8> {
        self.data.get(2).copied()
    }
}

struct MockState {
    responses: VecDeque<MockResponse>,
    requests: Vec<RecordedRequest>,
    responder: Option<Responder>,
}

struct MockTransportInner {
    state: Mutex<MockState>,
    inbound: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
    local_addr: SocketAddr,
}

/// Mock transport for testing JIP client functionality.
///
/// # Example
///
/// ```rust
/// use async_jip::transport::MockTransport;
/// use bytes::Bytes;
///
/// let mock = MockTransport::new();
///
/// // Answer the next request with an empty QUERY_MIB_RESPONSE
/// mock.queue_response(Bytes::from_static(&[0, 0x15, 0, 0, 0, 0]));
///
/// // Drop the one after that
/// mock.queue_timeout();
/// ```
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockTransportInner>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (inbound, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MockTransportInner {
                state: Mutex::new(MockState {
                    responses: VecDeque::new(),
                    requests: Vec::new(),
                    responder: None,
                }),
                inbound,
                receiver: tokio::sync::Mutex::new(receiver),
                local_addr: SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 49152),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a response with handle patching.
    pub fn queue_response(&self, data: impl Into<Bytes>) {
        self.state().responses.push_back(MockResponse::Data(data.into()));
    }

    /// Queue a raw response without handle patching.
    pub fn queue_raw_response(&self, data: impl Into<Bytes>) {
        self.state()
            .responses
            .push_back(MockResponse::RawData(data.into()));
    }

    /// Queue a dropped request.
    pub fn queue_timeout(&self) {
        self.state().responses.push_back(MockResponse::Timeout);
    }

    pub fn queue(&self, response: MockResponse) {
        self.state().responses.push_back(response);
    }

    /// Answer requests the queue does not cover.
    pub fn set_responder(&self, responder: Responder) {
        self.state().responder = Some(responder);
    }

    /// Deliver an unsolicited datagram, as a node sending a trap would.
    pub fn inject(&self, data: impl Into<Bytes>, source: SocketAddr) {
        let _ = self.inner.inbound.send((data.into(), source));
    }

    /// Get all recorded requests.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    /// Clear recorded requests.
    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    /// Number of queued responses remaining.
    pub fn queued_response_count(&self) -> usize {
        self.state().responses.len()
    }

    fn patch_handle(data: Bytes, request: &[u8]) -> Bytes {
        match (data.len() >= 3, request.get(2)) {
            (true, Some(handle)) => {
                let mut patched = data.to_vec();
                patched[2] = *handle;
                Bytes::from(patched)
            }
            _ => data,
        }
    }
}

impl Transport for MockTransport {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        let (queued, responder) = {
            let mut state = self.state();
            state.requests.push(RecordedRequest {
                data: Bytes::copy_from_slice(data),
                target,
            });
            (state.responses.pop_front(), state.responder.clone())
        };
        // The responder runs unlocked so it may use the mock itself.
        let replies = match queued {
            Some(MockResponse::Data(reply)) => vec![(Self::patch_handle(reply, data), target)],
            Some(MockResponse::DataFrom(reply, source)) => {
                vec![(Self::patch_handle(reply, data), source)]
            }
            Some(MockResponse::RawData(reply)) => vec![(reply, target)],
            Some(MockResponse::Timeout) => Vec::new(),
            None => responder.map_or_else(Vec::new, |responder| responder(data, target)),
        };
        for reply in replies {
            let _ = self.inner.inbound.send(reply);
        }
        Ok(())
    }

    async fn recv_from(&self) -> Result<(Bytes, SocketAddr)> {
        let mut receiver = self.inner.receiver.lock().await;
        receiver.recv().await.ok_or_else(|| {
            Error::Network {
                target: self.inner.local_addr,
                source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
            }
            .boxed()
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> SocketAddr {
        "[fd04::1]:1873".parse().unwrap()
    }

    #[tokio::test]
    async fn queued_response_gets_request_handle() {
        let mock = MockTransport::new();
        mock.queue_response(Bytes::from_static(&[0, 0x15, 0, 0, 0, 0]));
        mock.send_to(&[0, 0x14, 0x85, 0, 4], node()).await.unwrap();
        let (data, source) = mock.recv_from().await.unwrap();
        assert_eq!(data[2], 0x85);
        assert_eq!(source, node());
    }

    #[tokio::test]
    async fn raw_response_is_untouched() {
        let mock = MockTransport::new();
        mock.queue_raw_response(Bytes::from_static(&[0, 0x15, 0x09]));
        mock.send_to(&[0, 0x14, 0x01], node()).await.unwrap();
        let (data, _) = mock.recv_from().await.unwrap();
        assert_eq!(data[2], 0x09);
    }

    #[tokio::test]
    async fn records_requests_and_falls_back_to_responder() {
        let mock = MockTransport::new();
        mock.queue_timeout();
        mock.set_responder(Arc::new(|request: &[u8], target| {
            vec![(Bytes::copy_from_slice(request), target)]
        }));

        mock.send_to(b"one", node()).await.unwrap();
        mock.send_to(b"two", node()).await.unwrap();

        let (echo, _) = mock.recv_from().await.unwrap();
        assert_eq!(&echo[..], b"two");
        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].data.as_ref(), b"one");
        assert_eq!(requests[1].target, node());
    }

    #[tokio::test]
    async fn injected_datagrams_arrive() {
        let mock = MockTransport::new();
        mock.inject(Bytes::from_static(&[0, 0x1b, 0x12]), node());
        let (data, source) = mock.recv_from().await.unwrap();
        assert_eq!(data[1], 0x1b);
        assert_eq!(source, node());
    }
}
