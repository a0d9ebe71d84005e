//! Bus client: pub/sub plus synchronous service calls.
//!
//! One reader task dispatches incoming frames; one writer task drains an
//! outbound queue, so `publish` and `respond` are plain synchronous sends.
//! Frames from a single client are processed by the broker in order, which
//! is what makes "subscribe, then register, then answer probes" a valid
//! readiness handshake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::frame::{BrokerFrame, BusErrorKind, BusMessage, ClientFrame};
use super::BusError;

/// An inbound service request; answer it with [`BusClient::respond`].
#[derive(Debug)]
pub struct ServiceRequest {
    pub service: String,
    pub id: u64,
    pub payload: Value,
}

enum SubscriberSlot {
    /// Single-topic receiver.
    Plain(mpsc::UnboundedSender<BusMessage>),
    /// Shared receiver tagged with the topic; preserves cross-topic arrival
    /// order, which the agent node needs for episode-boundary handling.
    Tagged(mpsc::UnboundedSender<(String, BusMessage)>),
}

struct ClientInner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, BusError>>>>,
    subscribers: Mutex<HashMap<String, SubscriberSlot>>,
    requests_tx: mpsc::UnboundedSender<ServiceRequest>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<ServiceRequest>>>,
}

/// Handle to one bus connection. Cheap to clone; all clones share the
/// connection.
#[derive(Clone)]
pub struct BusClient {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    inner: Arc<ClientInner>,
}

impl BusClient {
    pub async fn connect(addr: &str) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
        });

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let mut line = match serde_json::to_vec(&frame) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, "unencodable client frame dropped");
                        continue;
                    }
                };
                line.push(b'\n');
                if write_half.write_all(&line).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(reader_loop(read_half, Arc::clone(&inner)));

        Ok(Self { outbound, inner })
    }

    fn send(&self, frame: ClientFrame) -> Result<(), BusError> {
        self.outbound.send(frame).map_err(|_| BusError::Closed)
    }

    /// Subscribe to one topic.
    pub fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<BusMessage>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string(), SubscriberSlot::Plain(tx));
        self.send(ClientFrame::Subscribe {
            topic: topic.to_string(),
        })?;
        Ok(rx)
    }

    /// Subscribe to several topics through one receiver, preserving the
    /// order in which messages arrived on the connection.
    pub fn subscribe_many(
        &self,
        topics: &[&str],
    ) -> Result<mpsc::UnboundedReceiver<(String, BusMessage)>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut subs = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for topic in topics {
                subs.insert(topic.to_string(), SubscriberSlot::Tagged(tx.clone()));
            }
        }
        for topic in topics {
            self.send(ClientFrame::Subscribe {
                topic: topic.to_string(),
            })?;
        }
        Ok(rx)
    }

    pub fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BusError> {
        self.send(ClientFrame::Publish {
            topic: topic.to_string(),
            message,
        })
    }

    /// Register this client as the provider of a service. Requests arrive
    /// on the stream returned by [`BusClient::take_requests`].
    pub fn register(&self, service: &str) -> Result<(), BusError> {
        self.send(ClientFrame::Register {
            service: service.to_string(),
        })
    }

    /// The inbound service-request stream. Yields `None` after the first
    /// call; a node owns its single request loop.
    pub fn take_requests(&self) -> Option<mpsc::UnboundedReceiver<ServiceRequest>> {
        self.inner
            .requests_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn respond(&self, id: u64, payload: Value) -> Result<(), BusError> {
        self.send(ClientFrame::Response { id, payload })
    }

    /// Synchronous service call; blocks until the provider answers, the
    /// broker reports the service unavailable, or the connection drops.
    pub async fn call(&self, service: &str, payload: Value) -> Result<Value, BusError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        self.send(ClientFrame::Request {
            service: service.to_string(),
            id,
            payload,
        })?;
        rx.await.map_err(|_| BusError::Closed)?
    }

    /// Check availability without invoking the service.
    pub async fn probe(&self, service: &str) -> Result<(), BusError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        self.send(ClientFrame::Probe {
            service: service.to_string(),
            id,
        })?;
        rx.await.map_err(|_| BusError::Closed)?.map(|_| ())
    }

    /// Poll for a service with bounded backoff, the startup handshake
    /// before the first episode-control call.
    pub async fn wait_for_service(
        &self,
        service: &str,
        attempts: u32,
        delay: std::time::Duration,
    ) -> Result<(), BusError> {
        for _ in 0..attempts {
            match self.probe(service).await {
                Ok(()) => return Ok(()),
                Err(BusError::ServiceUnavailable(_)) => tokio::time::sleep(delay).await,
                Err(err) => return Err(err),
            }
        }
        Err(BusError::Timeout(service.to_string()))
    }
}

async fn reader_loop(read_half: OwnedReadHalf, inner: Arc<ClientInner>) {
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let frame = match serde_json::from_str::<BrokerFrame>(&line) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "unparseable broker frame dropped");
                continue;
            }
        };
        match frame {
            BrokerFrame::Message { topic, message } => {
                let subs = inner
                    .subscribers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                match subs.get(&topic) {
                    Some(SubscriberSlot::Plain(tx)) => {
                        let _ = tx.send(message);
                    }
                    Some(SubscriberSlot::Tagged(tx)) => {
                        let _ = tx.send((topic.clone(), message));
                    }
                    None => {}
                }
            }
            BrokerFrame::Request { service, id, payload } => {
                let _ = inner.requests_tx.send(ServiceRequest {
                    service,
                    id,
                    payload,
                });
            }
            BrokerFrame::Response { id, payload } => {
                if let Some(tx) = inner
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id)
                {
                    let _ = tx.send(Ok(payload));
                }
            }
            BrokerFrame::Error { id: Some(id), error, reason } => {
                if let Some(tx) = inner
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id)
                {
                    let err = match error {
                        BusErrorKind::ServiceUnavailable => BusError::ServiceUnavailable(reason),
                        BusErrorKind::Protocol => BusError::Protocol(reason),
                    };
                    let _ = tx.send(Err(err));
                }
            }
            BrokerFrame::Error { id: None, error, reason } => {
                warn!(?error, reason = %reason, "broker error");
            }
        }
    }

    // connection gone: fail every caller still waiting
    let mut pending = inner.pending.lock().unwrap_or_else(|e| e.into_inner());
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(BusError::Closed));
    }
}
