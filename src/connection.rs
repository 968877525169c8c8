//! wiretap/src/connection.rs
//! Per-session state machine: parse, resolve, connect, splice.

use crate::{
    protocol::{self, RequestEntity, Uri},
    relay::RelayHandle,
    types::{ParseKind, ProxyError, ProxyOptions, Result, SessionId},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, lookup_host},
    sync::watch,
    time::timeout,
};
use tracing::{debug, info, warn};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const SPLICE_BUF_LEN: usize = 8192;

struct Established {
    origin: TcpStream,
    host: String,
    /// Origin-form rewrite of the request; absent for CONNECT.
    rewritten: Option<Vec<u8>>,
    residual: Vec<u8>,
}

/// Resolves once shutdown has been flagged, however late the caller looks.
/// A dropped sender counts as shutdown.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            break;
        }
    }
}

/// Main session workflow. Owns both sockets for the session's lifetime;
/// they are closed exactly once, when this task returns. Shutdown is
/// cooperative: the cancel signal interrupts the session at its next
/// suspension point and the session still runs its own teardown.
pub async fn handle_conn(
    id: SessionId,
    mut client: TcpStream,
    relay: RelayHandle,
    options: Arc<ProxyOptions>,
    mut cancel: watch::Receiver<bool>,
) {
    let established = tokio::select! {
        established = establish(id, &mut client, &options) => match established {
            Ok(established) => established,
            Err(e) => {
                // Deliberate silent close: the client gets no status line back.
                warn!(session = id, "session setup failed: {}", e);
                return;
            }
        },
        _ = cancelled(&mut cancel) => {
            debug!(session = id, "session cancelled before connect");
            return;
        }
    };
    let Established {
        mut origin,
        host,
        rewritten,
        residual,
    } = established;

    let (src, dst) = match (client.peer_addr(), origin.peer_addr()) {
        (Ok(src), Ok(dst)) => (src, dst),
        _ => return,
    };
    relay.connect(id, src, dst, &host);

    let deadline = Duration::from_secs(options.splice_deadline_secs);
    let tunnel = run_tunnel(id, &mut client, &mut origin, rewritten, residual, &relay);
    tokio::select! {
        result = timeout(deadline, tunnel) => match result {
            Ok(Ok((sent, recv))) => info!(session = id, sent, recv, "session closed"),
            Ok(Err(e)) => info!(session = id, "session stops, e={}", e),
            Err(_) => warn!(session = id, "session stops, e={}", ProxyError::Timeout),
        },
        _ = cancelled(&mut cancel) => info!(session = id, "session cancelled"),
    }

    relay.disconnect(id);
}

/// Parsing through Connecting: reads the preamble, resolves the target and
/// opens the origin socket. On CONNECT the 200 goes out here; for other
/// methods the origin-form rewrite is prepared for `run_tunnel`.
async fn establish(
    id: SessionId,
    client: &mut TcpStream,
    options: &ProxyOptions,
) -> Result<Established> {
    let (head, residual) = protocol::read_preamble(client, options.max_preamble_bytes).await?;
    let entity = RequestEntity::parse(&head)?;
    let uri = Uri::parse(&entity.target)?;
    if uri.port == 0 {
        return Err(ProxyError::Parse {
            kind: ParseKind::Uri,
            input: entity.target.clone(),
        });
    }
    debug!(session = id, method = %entity.method, target = %entity.target, "parsed request");

    let endpoint = resolve(&uri).await?;
    let origin = TcpStream::connect(endpoint)
        .await
        .map_err(|e| ProxyError::Connect {
            endpoint,
            source: e,
        })?;

    let rewritten = if entity.method == "CONNECT" {
        client.write_all(CONNECT_ESTABLISHED).await?;
        None
    } else {
        Some(entity.dump()?)
    };

    Ok(Established {
        origin,
        host: uri.host,
        rewritten,
        residual,
    })
}

/// Literal IPs skip the resolver; otherwise the first resolved endpoint wins.
async fn resolve(uri: &Uri) -> Result<SocketAddr> {
    if let Ok(ip) = uri.host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, uri.port));
    }
    let mut endpoints = lookup_host((uri.host.as_str(), uri.port))
        .await
        .map_err(|_| ProxyError::Resolve {
            host: uri.host.clone(),
        })?;
    endpoints.next().ok_or_else(|| ProxyError::Resolve {
        host: uri.host.clone(),
    })
}

async fn run_tunnel(
    id: SessionId,
    client: &mut TcpStream,
    origin: &mut TcpStream,
    rewritten: Option<Vec<u8>>,
    residual: Vec<u8>,
    relay: &RelayHandle,
) -> std::io::Result<(u64, u64)> {
    let mut sent = 0u64;
    if let Some(request) = rewritten {
        relay.forward(id, true, &request);
        origin.write_all(&request).await?;
        sent += request.len() as u64;
    }
    let (spliced_out, spliced_in) = splice(id, client, origin, residual, relay).await?;
    Ok((sent + spliced_out, spliced_in))
}

/// Full-duplex byte splicing between the two sockets. Each direction reads,
/// reports the chunk to the relay, then writes; a zero-length read
/// half-closes the peer and the opposite direction keeps draining. The
/// residual from the preamble read is replayed to the origin before
/// anything else.
async fn splice(
    id: SessionId,
    client: &mut TcpStream,
    origin: &mut TcpStream,
    residual: Vec<u8>,
    relay: &RelayHandle,
) -> std::io::Result<(u64, u64)> {
    let mut client_buf = [0u8; SPLICE_BUF_LEN];
    let mut origin_buf = [0u8; SPLICE_BUF_LEN];
    let mut client_closed = false;
    let mut origin_closed = false;
    let mut sent = 0u64;
    let mut recv = 0u64;

    if !residual.is_empty() {
        relay.forward(id, true, &residual);
        origin.write_all(&residual).await?;
        sent += residual.len() as u64;
    }

    loop {
        tokio::select! {
            biased;

            result = client.read(&mut client_buf), if !client_closed => {
                let n = result?;
                if n == 0 {
                    client_closed = true;
                    if !origin_closed {
                        origin.shutdown().await?;
                    }
                } else {
                    relay.forward(id, true, &client_buf[..n]);
                    origin.write_all(&client_buf[..n]).await?;
                    sent += n as u64;
                }
            },
            result = origin.read(&mut origin_buf), if !origin_closed => {
                let n = result?;
                if n == 0 {
                    origin_closed = true;
                    if !client_closed {
                        client.shutdown().await?;
                    }
                } else {
                    relay.forward(id, false, &origin_buf[..n]);
                    client.write_all(&origin_buf[..n]).await?;
                    recv += n as u64;
                }
            },
            else => {
                break;
            }
        }
    }

    Ok((sent, recv))
}
