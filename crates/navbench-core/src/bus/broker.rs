//! Star-topology message broker.
//!
//! One broker task per session; every node connects as a client. Topics fan
//! out to current subscribers (a subscriber that is not connected when a
//! message is published simply misses it). Service calls are routed to the
//! single registered provider with broker-assigned request ids.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::frame::{BrokerFrame, BusErrorKind, ClientFrame};
use super::BusError;

type ConnId = u64;

#[derive(Default)]
struct BrokerState {
    next_conn: ConnId,
    next_request: u64,
    conns: HashMap<ConnId, mpsc::UnboundedSender<BrokerFrame>>,
    subscriptions: HashMap<String, Vec<ConnId>>,
    services: HashMap<String, ConnId>,
    pending: HashMap<u64, PendingCall>,
}

struct PendingCall {
    requester: ConnId,
    requester_id: u64,
    provider: ConnId,
}

/// The broker: bind, then `run` the accept loop (typically on a spawned
/// task for the lifetime of the session).
pub struct Broker {
    listener: TcpListener,
    state: Arc<Mutex<BrokerState>>,
}

impl Broker {
    pub async fn bind(addr: &str) -> Result<Self, BusError> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            state: Arc::new(Mutex::new(BrokerState::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<(), BusError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(peer = %peer, "bus client connected");
            let state = Arc::clone(&self.state);
            tokio::spawn(handle_connection(stream, state));
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<Mutex<BrokerState>>) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<BrokerFrame>();

    let conn_id = {
        let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
        let id = s.next_conn;
        s.next_conn += 1;
        s.conns.insert(id, tx.clone());
        id
    };

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let mut line = match serde_json::to_vec(&frame) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "unencodable broker frame dropped");
                    continue;
                }
            };
            line.push(b'\n');
            if write_half.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ClientFrame>(&line) {
            Ok(frame) => handle_frame(conn_id, frame, &state),
            Err(err) => {
                let _ = tx.send(BrokerFrame::Error {
                    id: None,
                    error: BusErrorKind::Protocol,
                    reason: format!("unparseable frame: {err}"),
                });
            }
        }
    }

    disconnect(conn_id, &state);
    writer.abort();
    debug!(conn = conn_id, "bus client disconnected");
}

fn handle_frame(conn_id: ConnId, frame: ClientFrame, state: &Arc<Mutex<BrokerState>>) {
    let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
    match frame {
        ClientFrame::Subscribe { topic } => {
            let subs = s.subscriptions.entry(topic).or_default();
            if !subs.contains(&conn_id) {
                subs.push(conn_id);
            }
        }
        ClientFrame::Publish { topic, message } => {
            if let Some(subs) = s.subscriptions.get(&topic) {
                let frames: Vec<_> = subs
                    .iter()
                    .filter_map(|id| s.conns.get(id).cloned())
                    .collect();
                for sub_tx in frames {
                    let _ = sub_tx.send(BrokerFrame::Message {
                        topic: topic.clone(),
                        message: message.clone(),
                    });
                }
            }
        }
        ClientFrame::Register { service } => {
            s.services.insert(service, conn_id);
        }
        ClientFrame::Probe { service, id } => {
            let frame = if s.services.contains_key(&service) {
                BrokerFrame::Response {
                    id,
                    payload: serde_json::Value::Null,
                }
            } else {
                BrokerFrame::Error {
                    id: Some(id),
                    error: BusErrorKind::ServiceUnavailable,
                    reason: format!("no provider for {service}"),
                }
            };
            if let Some(tx) = s.conns.get(&conn_id) {
                let _ = tx.send(frame);
            }
        }
        ClientFrame::Request { service, id, payload } => {
            let provider = s.services.get(&service).copied();
            match provider.and_then(|p| s.conns.get(&p).cloned().map(|tx| (p, tx))) {
                Some((provider, provider_tx)) => {
                    let broker_id = s.next_request;
                    s.next_request += 1;
                    s.pending.insert(
                        broker_id,
                        PendingCall {
                            requester: conn_id,
                            requester_id: id,
                            provider,
                        },
                    );
                    let _ = provider_tx.send(BrokerFrame::Request {
                        service,
                        id: broker_id,
                        payload,
                    });
                }
                None => {
                    if let Some(tx) = s.conns.get(&conn_id) {
                        let _ = tx.send(BrokerFrame::Error {
                            id: Some(id),
                            error: BusErrorKind::ServiceUnavailable,
                            reason: format!("no provider for {service}"),
                        });
                    }
                }
            }
        }
        ClientFrame::Response { id, payload } => {
            if let Some(call) = s.pending.remove(&id) {
                if let Some(tx) = s.conns.get(&call.requester) {
                    let _ = tx.send(BrokerFrame::Response {
                        id: call.requester_id,
                        payload,
                    });
                }
            }
        }
    }
}

fn disconnect(conn_id: ConnId, state: &Arc<Mutex<BrokerState>>) {
    let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
    s.conns.remove(&conn_id);
    for subs in s.subscriptions.values_mut() {
        subs.retain(|id| *id != conn_id);
    }
    s.services.retain(|_, provider| *provider != conn_id);

    // callers waiting on a vanished provider would otherwise hang forever
    let orphaned: Vec<u64> = s
        .pending
        .iter()
        .filter(|(_, call)| call.provider == conn_id)
        .map(|(id, _)| *id)
        .collect();
    for id in orphaned {
        if let Some(call) = s.pending.remove(&id) {
            if let Some(tx) = s.conns.get(&call.requester) {
                let _ = tx.send(BrokerFrame::Error {
                    id: Some(call.requester_id),
                    error: BusErrorKind::ServiceUnavailable,
                    reason: "service provider disconnected".to_string(),
                });
            }
        }
    }
    s.pending.retain(|_, call| call.requester != conn_id);
}
