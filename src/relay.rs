//! wiretap/src/relay.rs
//! Single-writer observer bus: canonical connection/packet bookkeeping and
//! fan-out to registered observers.

use crate::types::{ConnRecord, PacketRecord, PacketSnapshot, RelaySnapshot, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Recipient of session lifecycle events. Per session id, an observer sees
/// at most one `connect`, then any number of `forward`s, then at most one
/// `disconnect`. `data` is only valid for the duration of the call.
pub trait NetworkObserver: Send {
    fn connect(&mut self, id: SessionId, src: SocketAddr, dst: SocketAddr, host: &str);
    /// `outside` is true for client-to-origin traffic.
    fn forward(&mut self, id: SessionId, outside: bool, data: &[u8]);
    fn disconnect(&mut self, id: SessionId);
}

enum RelayEvent {
    Connect {
        id: SessionId,
        src: SocketAddr,
        dst: SocketAddr,
        host: String,
    },
    Forward {
        id: SessionId,
        outside: bool,
        data: Vec<u8>,
    },
    Disconnect {
        id: SessionId,
    },
    Snapshot(oneshot::Sender<RelaySnapshot>),
    Shutdown,
}

/// Cloneable enqueue capability handed to sessions. Dispatch calls never
/// block; the worker applies events in send order per sender.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayEvent>,
}

impl RelayHandle {
    pub fn connect(&self, id: SessionId, src: SocketAddr, dst: SocketAddr, host: &str) {
        let _ = self.tx.send(RelayEvent::Connect {
            id,
            src,
            dst,
            host: host.to_string(),
        });
    }

    pub fn forward(&self, id: SessionId, outside: bool, data: &[u8]) {
        let _ = self.tx.send(RelayEvent::Forward {
            id,
            outside,
            data: data.to_vec(),
        });
    }

    pub fn disconnect(&self, id: SessionId) {
        let _ = self.tx.send(RelayEvent::Disconnect { id });
    }

    /// Round-trips a point-in-time copy of the canonical store through the
    /// worker. Returns `None` once the relay has stopped.
    pub async fn snapshot(&self) -> Option<RelaySnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RelayEvent::Snapshot(reply)).ok()?;
        rx.await.ok()
    }
}

/// The observer bus. Owns the worker that serializes all bookkeeping and
/// observer dispatch; everything else talks to it through `RelayHandle`s.
pub struct NetworkRelay {
    tx: mpsc::Sender<RelayEvent>,
    rx: Option<mpsc::Receiver<RelayEvent>>,
    observers: Vec<Box<dyn NetworkObserver>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl NetworkRelay {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        NetworkRelay {
            tx,
            rx: Some(rx),
            observers: Vec::new(),
            worker: None,
        }
    }

    /// Registration order is dispatch order. Must happen before `start`.
    pub fn register(&mut self, observer: Box<dyn NetworkObserver>) {
        self.observers.push(observer);
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn start(&mut self) {
        let Some(rx) = self.rx.take() else { return };
        let mut bookkeeper = Bookkeeper {
            conns: HashMap::new(),
            packets: Vec::new(),
            observers: std::mem::take(&mut self.observers),
        };
        self.worker = Some(thread::spawn(move || bookkeeper.run(rx)));
    }

    /// Drains every event enqueued so far, then joins the worker. Events
    /// sent after this are dropped.
    pub fn stop(&mut self) {
        let _ = self.tx.send(RelayEvent::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Default for NetworkRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NetworkRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Bookkeeper {
    conns: HashMap<SessionId, ConnRecord>,
    packets: Vec<PacketRecord>,
    observers: Vec<Box<dyn NetworkObserver>>,
}

impl Bookkeeper {
    fn run(&mut self, rx: mpsc::Receiver<RelayEvent>) {
        while let Ok(event) = rx.recv() {
            match event {
                RelayEvent::Connect { id, src, dst, host } => self.on_connect(id, src, dst, host),
                RelayEvent::Forward { id, outside, data } => self.on_forward(id, outside, &data),
                RelayEvent::Disconnect { id } => self.on_disconnect(id),
                RelayEvent::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                RelayEvent::Shutdown => break,
            }
        }
    }

    fn on_connect(&mut self, id: SessionId, src: SocketAddr, dst: SocketAddr, host: String) {
        info!(session = id, %src, %dst, %host, "remote connected");
        self.conns.insert(
            id,
            ConnRecord {
                src,
                dst,
                host: host.clone(),
                online: true,
            },
        );
        self.dispatch(|observer| observer.connect(id, src, dst, &host));
    }

    fn on_forward(&mut self, id: SessionId, outside: bool, data: &[u8]) {
        // Late events for sessions that never connected, or that already
        // disconnected, are dropped.
        match self.conns.get(&id) {
            Some(conn) if conn.online => {}
            _ => return,
        }
        debug!(session = id, outside, len = data.len(), "forward packet");
        self.packets.push(PacketRecord {
            id,
            outside,
            at: Instant::now(),
            len: data.len(),
        });
        self.dispatch(|observer| observer.forward(id, outside, data));
    }

    fn on_disconnect(&mut self, id: SessionId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if !conn.online {
            return;
        }
        conn.online = false;
        info!(session = id, "remote disconnected");
        self.dispatch(|observer| observer.disconnect(id));
    }

    fn dispatch(&mut self, mut call: impl FnMut(&mut dyn NetworkObserver)) {
        for observer in &mut self.observers {
            // A failing observer aborts only its own call.
            if panic::catch_unwind(AssertUnwindSafe(|| call(observer.as_mut()))).is_err() {
                error!("observer panicked, event dropped for it");
            }
        }
    }

    fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            connections: self.conns.clone(),
            packets: self
                .packets
                .iter()
                .map(|p| PacketSnapshot {
                    id: p.id,
                    outside: p.outside,
                    len: p.len,
                })
                .collect(),
        }
    }
}
