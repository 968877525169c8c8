//! wiretap/src/proxy.rs
//! Listener lifecycle: bind, accept, session spawning, shutdown.

use crate::{
    connection, logging,
    relay::{NetworkObserver, NetworkRelay, RelayHandle},
    types::{ProxyOptions, Result, SessionId},
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tracing::{debug, error, info};

/// How long `shutdown` waits for cancelled sessions to run their teardown
/// before aborting stragglers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct SessionManager {
    sessions: HashMap<SessionId, JoinHandle<()>>,
}

impl SessionManager {
    fn insert(&mut self, id: SessionId, handle: JoinHandle<()>) {
        self.sessions.insert(id, handle);
    }

    fn remove(&mut self, id: &SessionId) -> Option<JoinHandle<()>> {
        self.sessions.remove(id)
    }

    fn drain(&mut self) -> Vec<JoinHandle<()>> {
        self.sessions.drain().map(|(_, handle)| handle).collect()
    }

    fn all_finished(&self) -> bool {
        self.sessions.values().all(|handle| handle.is_finished())
    }
}

/// The intercepting proxy: owns the runtime the sessions run on, the
/// observer bus, and the accept loop. Observers are registered before
/// `start`; `shutdown` (or drop) cancels everything in flight.
pub struct HttpProxy {
    options: Arc<ProxyOptions>,
    runtime: Option<tokio::runtime::Runtime>,
    relay: NetworkRelay,
    sessions: Arc<Mutex<SessionManager>>,
    next_session: Arc<AtomicU64>,
    cancel: watch::Sender<bool>,
    acceptor: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl HttpProxy {
    pub fn new(options: ProxyOptions) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(options.worker_threads)
            .enable_all()
            .build()
            .unwrap();
        let (cancel, _) = watch::channel(false);
        HttpProxy {
            options: Arc::new(options),
            runtime: Some(runtime),
            relay: NetworkRelay::new(),
            sessions: Arc::new(Mutex::new(SessionManager::default())),
            next_session: Arc::new(AtomicU64::new(0)),
            cancel,
            acceptor: None,
            local_addr: None,
        }
    }

    /// Registration order is dispatch order. Must happen before `start`.
    pub fn register(&mut self, observer: Box<dyn NetworkObserver>) {
        self.relay.register(observer);
    }

    /// Binds the listen socket and launches the accept loop. Bind failures
    /// surface here; port 0 picks an ephemeral port, see `local_addr`.
    pub fn start(&mut self) -> Result<()> {
        logging::init_logging("info");
        if self.acceptor.is_some() {
            return Ok(());
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Ok(());
        };
        self.relay.start();

        let listener =
            std::net::TcpListener::bind((self.options.bind_addr.as_str(), self.options.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let relay = self.relay.handle();
        let sessions = Arc::clone(&self.sessions);
        let next_session = Arc::clone(&self.next_session);
        let options = Arc::clone(&self.options);
        let cancel = self.cancel.subscribe();
        self.acceptor = Some(runtime.spawn(async move {
            let listener = match TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    error!("failed to adopt listen socket: {}", e);
                    return;
                }
            };
            info!(%local_addr, "proxy listening");
            accept_loop(listener, relay, sessions, next_session, options, cancel).await;
        }));
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops accepting and flags every in-flight session to cancel; sessions
    /// observe the signal at their next suspension point and run their own
    /// teardown, so observers still see the matching disconnects. Once they
    /// drain (or the grace period runs out) the runtime and the observer bus
    /// are torn down.
    pub fn shutdown(&mut self) {
        let _ = self.cancel.send(true);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let acceptor_done = self.acceptor.as_ref().is_none_or(|h| h.is_finished());
            let sessions_done = self.sessions.lock().unwrap().all_finished();
            if acceptor_done && sessions_done {
                break;
            }
            if Instant::now() >= deadline {
                if let Some(acceptor) = self.acceptor.take() {
                    acceptor.abort();
                }
                for handle in self.sessions.lock().unwrap().drain() {
                    handle.abort();
                }
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.acceptor = None;

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        self.relay.stop();
    }
}

impl Drop for HttpProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    relay: RelayHandle,
    sessions: Arc<Mutex<SessionManager>>,
    next_session: Arc<AtomicU64>,
    options: Arc<ProxyOptions>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = connection::cancelled(&mut cancel) => {
                info!("listener stopped");
                break;
            }
        };
        match accepted {
            Ok((client, peer)) => {
                let id = next_session.fetch_add(1, Ordering::SeqCst);
                debug!(session = id, %peer, "accepted client");
                let task = tokio::spawn({
                    let relay = relay.clone();
                    let sessions = Arc::clone(&sessions);
                    let options = Arc::clone(&options);
                    let cancel = cancel.clone();
                    async move {
                        connection::handle_conn(id, client, relay, options, cancel).await;
                        sessions.lock().unwrap().remove(&id);
                    }
                });
                sessions.lock().unwrap().insert(id, task);
            }
            Err(e) => {
                error!("accept error: {}", e);
                break;
            }
        }
    }
}
