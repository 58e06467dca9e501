#![allow(clippy::unwrap_used)]

//! TCP server behavior over real sockets: idle close, graceful stop,
//! max-connections gating, session numbering, info payload.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use wirebeam::event::{EventCallback, EventPayload};
use wirebeam::tcp::{TcpServer, TcpServerConfig};

use support::{TEST_TIMEOUT, echo_factory};

async fn started_server(config: TcpServerConfig) -> Arc<TcpServer> {
    let server = TcpServer::new(echo_factory(), config);
    server.start_serving(64, None).await.unwrap();
    assert!(server.events().fired("start"));
    server
}

fn local_config() -> TcpServerConfig {
    TcpServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .build()
}

async fn echo_roundtrip(stream: &mut TcpStream, line: &[u8]) {
    stream.write_all(line).await.unwrap();
    let mut response = vec![0u8; line.len()];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, line);
}

#[tokio::test]
async fn serves_echo_and_reports_info() {
    let server = started_server(
        TcpServerConfig::builder()
            .address("127.0.0.1:0".parse().unwrap())
            .keep_alive(Duration::from_secs(30))
            .build(),
    )
    .await;
    let addr = server.addresses()[0];

    let mut client = TcpStream::connect(addr).await.unwrap();
    echo_roundtrip(&mut client, b"hi\n").await;

    let info = server.info();
    assert_eq!(info.server.sockets.len(), 1);
    assert_eq!(info.server.sockets[0].address, addr.to_string());
    assert_eq!(info.server.keep_alive_in_seconds, 30);
    assert_eq!(info.clients.processed_clients, 1);
    assert_eq!(info.clients.connected_clients, 1);
    assert_eq!(info.clients.requests_processed, 1);

    let serialized = serde_json::to_value(&info).unwrap();
    assert!(serialized["server"]["uptime_in_seconds"].is_u64());
    assert!(serialized["clients"]["requests_processed"].is_u64());

    drop(client);
    server.close().await;
}

#[tokio::test]
async fn idle_connection_is_closed_after_the_keep_alive() {
    let server = started_server(
        TcpServerConfig::builder()
            .address("127.0.0.1:0".parse().unwrap())
            .keep_alive(Duration::from_secs(1))
            .build(),
    )
    .await;
    let addr = server.addresses()[0];

    let (lost_tx, mut lost_rx) = tokio::sync::mpsc::unbounded_channel();
    let on_lost: EventCallback = Arc::new(move |outcome| {
        let _ = lost_tx.send(outcome.error.is_some());
        Ok(())
    });
    server.events().bind("connection_lost", on_lost).unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();

    // Total silence: the idle timer closes the connection, not an error.
    let lost_with_error = timeout(Duration::from_secs(3), lost_rx.recv()).await.unwrap().unwrap();
    assert!(!lost_with_error);

    // The peer observes a clean EOF.
    let mut buf = [0u8; 1];
    let read = timeout(TEST_TIMEOUT, client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(read, 0);

    timeout(TEST_TIMEOUT, async {
        while server.connection_count() != 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    server.close().await;
}

#[tokio::test]
async fn activity_rearms_the_idle_timer() {
    let server = started_server(
        TcpServerConfig::builder()
            .address("127.0.0.1:0".parse().unwrap())
            .keep_alive(Duration::from_millis(500))
            .build(),
    )
    .await;
    let addr = server.addresses()[0];

    let mut client = TcpStream::connect(addr).await.unwrap();

    // Keep the connection busy across several idle windows.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        echo_roundtrip(&mut client, b"ping\n").await;
    }
    assert_eq!(server.connection_count(), 1);

    server.close().await;
}

#[tokio::test]
async fn close_drains_connections_and_fires_stop_once() {
    let server = started_server(local_config()).await;
    let addr = server.addresses()[0];

    let stops = Arc::new(AtomicUsize::new(0));
    let stops_in_listener = Arc::clone(&stops);
    let on_stop: EventCallback = Arc::new(move |_outcome| {
        stops_in_listener.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    server.events().bind("stop", on_stop).unwrap();

    // Three connections mid-request (no newline yet).
    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"mid-request").await.unwrap();
        let mut echoed = vec![0u8; 11];
        timeout(TEST_TIMEOUT, client.read_exact(&mut echoed)).await.unwrap().unwrap();
        clients.push(client);
    }
    assert_eq!(server.connection_count(), 3);

    timeout(TEST_TIMEOUT, server.close()).await.unwrap();

    assert_eq!(server.connection_count(), 0);
    assert!(server.events().fired("stop"));
    assert_eq!(stops.load(Ordering::SeqCst), 1);

    // Every client sees its connection go away.
    for mut client in clients {
        let mut buf = [0u8; 1];
        let read = timeout(TEST_TIMEOUT, client.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(read, 0);
    }

    // Closing again observes the same terminal state.
    timeout(TEST_TIMEOUT, server.close()).await.unwrap();
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn lifecycle_events_fire_in_order() {
    let server = started_server(local_config()).await;
    let addr = server.addresses()[0];

    let sequence = Arc::new(parking_lot::Mutex::new(Vec::<&'static str>::new()));
    for event in ["connection_made", "pre_request", "post_request", "connection_lost"] {
        let sequence_in_listener = Arc::clone(&sequence);
        let listener: EventCallback = Arc::new(move |_outcome| {
            sequence_in_listener.lock().push(event);
            Ok(())
        });
        server.events().bind(event, listener).unwrap();
    }

    let mut client = TcpStream::connect(addr).await.unwrap();
    echo_roundtrip(&mut client, b"hi\n").await;
    drop(client);

    timeout(TEST_TIMEOUT, async {
        while sequence.lock().len() < 4 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        sequence.lock().clone(),
        vec!["connection_made", "pre_request", "post_request", "connection_lost"]
    );

    server.close().await;
}

#[tokio::test]
async fn session_numbers_increase_without_gaps() {
    let server = started_server(local_config()).await;
    let addr = server.addresses()[0];

    let sessions = Arc::new(parking_lot::Mutex::new(Vec::<u64>::new()));
    let sessions_in_listener = Arc::clone(&sessions);
    let on_made: EventCallback = Arc::new(move |outcome| {
        if let EventPayload::Session(session) = outcome.payload {
            sessions_in_listener.lock().push(session);
        }
        Ok(())
    });
    server.events().bind("connection_made", on_made).unwrap();

    for _ in 0..3 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut client, b"hi\n").await;
    }

    timeout(TEST_TIMEOUT, async {
        while sessions.lock().len() < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    assert_eq!(sessions.lock().clone(), vec![1, 2, 3]);
    server.close().await;
}

#[tokio::test]
async fn exceeding_max_connections_stops_accepting_and_drains() {
    let server = started_server(
        TcpServerConfig::builder()
            .address("127.0.0.1:0".parse().unwrap())
            .max_connections(2)
            .build(),
    )
    .await;
    let addr = server.addresses()[0];

    // The first two sessions are served normally.
    let mut first = TcpStream::connect(addr).await.unwrap();
    echo_roundtrip(&mut first, b"one\n").await;
    let mut second = TcpStream::connect(addr).await.unwrap();
    echo_roundtrip(&mut second, b"two\n").await;

    // The third session exceeds the cap and triggers the shutdown; it still
    // drains with the rest.
    let mut third = TcpStream::connect(addr).await.unwrap();
    echo_roundtrip(&mut third, b"three\n").await;

    drop(first);
    drop(second);
    drop(third);

    let outcome = timeout(TEST_TIMEOUT, server.events().wait("stop")).await.unwrap().unwrap();
    assert!(!outcome.is_error());

    // No new connection gets served after the gate fired.
    match timeout(Duration::from_secs(2), TcpStream::connect(addr)).await {
        Ok(Ok(mut late)) => {
            late.write_all(b"late\n").await.unwrap();
            let mut buf = [0u8; 1];
            let read = timeout(TEST_TIMEOUT, late.read(&mut buf)).await.unwrap().unwrap_or(0);
            assert_eq!(read, 0, "late connection must not be served");
        }
        // Refused outright is just as good.
        Ok(Err(_)) | Err(_) => {}
    }
}

#[tokio::test]
async fn startup_failure_fires_start_with_the_error() {
    // Grab a port with a pre-bound listener so the server cannot bind it.
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();

    let server = TcpServer::new(echo_factory(), TcpServerConfig::builder().address(addr).build());

    let result = server.start_serving(64, None).await;
    assert!(result.is_err());

    let outcome = server.events().outcome("start").unwrap().unwrap();
    assert!(outcome.is_error());
}

#[tokio::test]
async fn stop_serving_keeps_open_connections_alive() {
    let server = started_server(local_config()).await;
    let addr = server.addresses()[0];

    let mut client = TcpStream::connect(addr).await.unwrap();
    echo_roundtrip(&mut client, b"hi\n").await;

    server.stop_serving();

    // The existing connection still works…
    echo_roundtrip(&mut client, b"still here\n").await;

    // …while new ones are not accepted.
    match timeout(Duration::from_secs(2), TcpStream::connect(addr)).await {
        Ok(Ok(mut late)) => {
            late.write_all(b"late\n").await.unwrap();
            let mut buf = [0u8; 1];
            let read = timeout(TEST_TIMEOUT, late.read(&mut buf)).await.unwrap().unwrap_or(0);
            assert_eq!(read, 0);
        }
        Ok(Err(_)) | Err(_) => {}
    }

    drop(client);
    server.close().await;
}
