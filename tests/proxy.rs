//! End-to-end proxy scenarios against mock origins.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use wiretap::proxy::HttpProxy;
use wiretap::relay::NetworkObserver;
use wiretap::types::{ProxyOptions, SessionId};

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connect { id: SessionId, host: String },
    Forward { id: SessionId, outside: bool, len: usize },
    Disconnect { id: SessionId },
}

struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl NetworkObserver for Recorder {
    fn connect(&mut self, id: SessionId, _src: SocketAddr, _dst: SocketAddr, host: &str) {
        self.events.lock().unwrap().push(Event::Connect {
            id,
            host: host.to_string(),
        });
    }

    fn forward(&mut self, id: SessionId, outside: bool, data: &[u8]) {
        self.events.lock().unwrap().push(Event::Forward {
            id,
            outside,
            len: data.len(),
        });
    }

    fn disconnect(&mut self, id: SessionId) {
        self.events.lock().unwrap().push(Event::Disconnect { id });
    }
}

fn start_proxy() -> (HttpProxy, SocketAddr, Arc<Mutex<Vec<Event>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut proxy = HttpProxy::new(ProxyOptions {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        ..ProxyOptions::default()
    });
    proxy.register(Box::new(Recorder {
        events: events.clone(),
    }));
    proxy.start().expect("proxy start");
    let addr = proxy.local_addr().expect("proxy bound");
    (proxy, addr, events)
}

/// Polls the recorded events until the predicate holds or two seconds pass,
/// then returns whatever was recorded; the caller's asserts explain failures.
async fn wait_for(events: &Arc<Mutex<Vec<Event>>>, pred: impl Fn(&[Event]) -> bool) -> Vec<Event> {
    for _ in 0..200 {
        {
            let recorded = events.lock().unwrap();
            if pred(&recorded) {
                return recorded.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    events.lock().unwrap().clone()
}

fn ends_disconnected(events: &[Event]) -> bool {
    matches!(events.last(), Some(Event::Disconnect { .. }))
}

fn sum_forwarded(events: &[Event], expect_outside: bool) -> usize {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Forward { outside, len, .. } if *outside == expect_outside => Some(*len),
            _ => None,
        })
        .sum()
}

fn count_disconnects(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, Event::Disconnect { .. }))
        .count()
}

#[tokio::test]
async fn rewrites_plain_http_requests() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let expected = format!(
        "GET /a HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin_addr.port()
    );
    let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    let origin_task = tokio::spawn({
        let expected = expected.clone();
        async move {
            let (mut sock, _) = origin.accept().await.unwrap();
            let mut buf = vec![0u8; expected.len()];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, expected.as_bytes());
            sock.write_all(reply).await.unwrap();
            let n = sock.read(&mut [0u8; 16]).await.unwrap();
            assert_eq!(n, 0, "client side should close after the response");
        }
    });

    let (_proxy, addr, events) = start_proxy();
    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{port}/a HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = origin_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = vec![0u8; reply.len()];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(response, reply);
    drop(client);
    origin_task.await.unwrap();

    let events = wait_for(&events, ends_disconnected).await;
    assert!(
        matches!(events.first(), Some(Event::Connect { host, .. }) if host == "127.0.0.1"),
        "events start with a connect: {events:?}"
    );
    assert_eq!(sum_forwarded(&events, true), expected.len());
    assert_eq!(sum_forwarded(&events, false), reply.len());
    assert_eq!(count_disconnects(&events), 1);
    assert!(ends_disconnected(&events), "events end with the disconnect");
}

#[tokio::test]
async fn tunnels_connect_sessions() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut sock, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 5];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        sock.write_all(b"world").await.unwrap();
        let n = sock.read(&mut [0u8; 16]).await.unwrap();
        assert_eq!(n, 0, "tunnel should close after the client leaves");
    });

    let (_proxy, addr, events) = start_proxy();
    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n",
        origin_addr.port()
    );
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut status = vec![0u8; ESTABLISHED.len()];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, ESTABLISHED);

    client.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"world");
    drop(client);
    origin_task.await.unwrap();

    let events = wait_for(&events, ends_disconnected).await;
    assert!(
        matches!(events.first(), Some(Event::Connect { host, .. }) if host == "127.0.0.1"),
        "events start with a connect: {events:?}"
    );
    assert_eq!(sum_forwarded(&events, true), 5);
    assert_eq!(sum_forwarded(&events, false), 5);
    assert_eq!(count_disconnects(&events), 1);
}

#[tokio::test]
async fn preserves_body_read_with_the_preamble() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let expected = b"POST /p HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc".to_vec();
    let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
    let origin_task = tokio::spawn({
        let expected = expected.clone();
        async move {
            let (mut sock, _) = origin.accept().await.unwrap();
            let mut buf = vec![0u8; expected.len()];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, expected);
            sock.write_all(reply).await.unwrap();
            let n = sock.read(&mut [0u8; 16]).await.unwrap();
            assert_eq!(n, 0);
        }
    });

    let (_proxy, addr, events) = start_proxy();
    let mut client = TcpStream::connect(addr).await.unwrap();
    // Preamble and body in one segment; the residual must reach the origin.
    let request = format!(
        "POST http://127.0.0.1:{}/p HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
        origin_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = vec![0u8; reply.len()];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(response, reply.as_slice());
    drop(client);
    origin_task.await.unwrap();

    let events = wait_for(&events, ends_disconnected).await;
    let outside_lens: Vec<usize> = events
        .iter()
        .filter_map(|event| match event {
            Event::Forward { outside: true, len, .. } => Some(*len),
            _ => None,
        })
        .collect();
    // One event for the rewritten preamble, exactly one for the residual.
    assert_eq!(outside_lens, vec![expected.len() - 3, 3]);
}

#[tokio::test]
async fn closes_silently_on_resolve_failure() {
    let (_proxy, addr, events) = start_proxy();
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            b"GET http://no-such-host.invalid/ HTTP/1.1\r\nHost: no-such-host.invalid\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(response.is_empty(), "no status line on failure");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.lock().unwrap().is_empty(), "no events without a connect");
}

#[tokio::test]
async fn drains_origin_half_close() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut sock, _) = origin.accept().await.unwrap();
        sock.write_all(b"0123456789").await.unwrap();
        // Closing the socket ends the origin-to-client direction.
    });

    let (_proxy, addr, events) = start_proxy();
    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n",
        origin_addr.port()
    );
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut status = vec![0u8; ESTABLISHED.len()];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, ESTABLISHED);
    origin_task.await.unwrap();

    let mut tunneled = Vec::new();
    client.read_to_end(&mut tunneled).await.unwrap();
    assert_eq!(tunneled, b"0123456789");
    drop(client);

    let events = wait_for(&events, ends_disconnected).await;
    assert_eq!(sum_forwarded(&events, false), 10);
    assert_eq!(count_disconnects(&events), 1);
}

#[tokio::test]
async fn closes_silently_on_malformed_start_line() {
    let (_proxy, addr, events) = start_proxy();
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GARBAGE\r\n\r\n").await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(response.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_disconnects_inflight_sessions() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut sock, _) = origin.accept().await.unwrap();
        // Hold the tunnel open until the proxy goes away.
        let mut buf = [0u8; 16];
        while sock.read(&mut buf).await.map_or(false, |n| n > 0) {}
    });

    let (mut proxy, addr, events) = start_proxy();
    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n",
        origin_addr.port()
    );
    client.write_all(connect.as_bytes()).await.unwrap();
    let mut status = vec![0u8; ESTABLISHED.len()];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, ESTABLISHED);
    client.write_all(b"hold").await.unwrap();

    wait_for(&events, |recorded| sum_forwarded(recorded, true) == 4).await;

    // Cancelled sessions still run their own teardown, so the observer sees
    // the matching disconnect before shutdown returns.
    proxy.shutdown();
    let events = events.lock().unwrap().clone();
    assert!(
        matches!(events.first(), Some(Event::Connect { .. })),
        "events start with a connect: {events:?}"
    );
    assert_eq!(count_disconnects(&events), 1);
    assert!(ends_disconnected(&events));

    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest).await;
    origin_task.await.unwrap();
}

#[tokio::test]
async fn session_ids_are_monotonic_per_proxy() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        for _ in 0..2 {
            let (mut sock, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            sock.write_all(b"pong").await.unwrap();
        }
    });

    let (_proxy, addr, events) = start_proxy();
    for round in 0..2usize {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let connect = format!(
            "CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n",
            origin_addr.port()
        );
        client.write_all(connect.as_bytes()).await.unwrap();
        let mut status = vec![0u8; ESTABLISHED.len()];
        client.read_exact(&mut status).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        drop(client);

        wait_for(&events, |recorded| count_disconnects(recorded) == round + 1).await;
    }
    origin_task.await.unwrap();

    let events = wait_for(&events, |recorded| count_disconnects(recorded) == 2).await;
    let connect_ids: Vec<SessionId> = events
        .iter()
        .filter_map(|event| match event {
            Event::Connect { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(connect_ids, vec![0, 1]);
}
