#![allow(clippy::unwrap_used)]

//! Client-side connections: `connect`, `start(request)`, `on_finished`.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::timeout;
use wirebeam::connection::{Connection, connect};
use wirebeam::producer::Producer;
use wirebeam::protocol::PeerKind;
use wirebeam::tcp::{TcpServer, TcpServerConfig};

use support::{TEST_TIMEOUT, echo_factory, line_client_factory};

async fn echo_server() -> Arc<TcpServer> {
    let server = TcpServer::new(
        echo_factory(),
        TcpServerConfig::builder().address("127.0.0.1:0".parse().unwrap()).build(),
    );
    server.start_serving(64, None).await.unwrap();
    server
}

#[tokio::test]
async fn client_request_roundtrips_through_the_echo_server() {
    let server = echo_server().await;
    let addr = server.addresses()[0];

    let lines = Arc::new(Mutex::new(Vec::new()));
    let producer = Producer::new(
        Connection::factory(line_client_factory("a", Arc::clone(&lines))),
        Producer::server_events(),
        Duration::ZERO,
    );

    let connection = timeout(TEST_TIMEOUT, connect(&producer, addr)).await.unwrap().unwrap();
    assert_eq!(connection.protocol().kind(), PeerKind::Client);
    assert!(connection.protocol().address().is_some());

    let consumer = connection.current_consumer().unwrap();
    consumer.start(Some(Bytes::from_static(b"marco\n"))).unwrap();

    let outcome = timeout(TEST_TIMEOUT, consumer.on_finished()).await.unwrap();
    assert!(!outcome.is_error());
    assert_eq!(lines.lock().clone(), vec![("a", "marco".to_owned())]);

    // The finished consumer vacated the slot: a second request gets a fresh
    // one on the same connection.
    let consumer = connection.current_consumer().unwrap();
    consumer.start(Some(Bytes::from_static(b"polo\n"))).unwrap();
    let outcome = timeout(TEST_TIMEOUT, consumer.on_finished()).await.unwrap();
    assert!(!outcome.is_error());
    assert_eq!(connection.processed(), 2);
    assert_eq!(producer.requests_processed(), 2);

    connection.protocol().close();
    server.close().await;
}

#[tokio::test]
async fn failing_start_request_finishes_the_consumer_with_the_error() {
    struct BrokenStart;

    impl wirebeam::RequestHandler for BrokenStart {
        fn data_received(
            &mut self,
            _consumer: &wirebeam::ProtocolConsumer,
            _data: Bytes,
        ) -> anyhow::Result<Option<Bytes>> {
            Ok(None)
        }

        fn start_request(&mut self, _consumer: &wirebeam::ProtocolConsumer) -> anyhow::Result<()> {
            anyhow::bail!("stale socket")
        }
    }

    let server = echo_server().await;
    let addr = server.addresses()[0];

    let producer = Producer::new(
        Connection::factory(Arc::new(|| wirebeam::ProtocolConsumer::new(Box::new(BrokenStart)))),
        Producer::server_events(),
        Duration::ZERO,
    );

    let connection = timeout(TEST_TIMEOUT, connect(&producer, addr)).await.unwrap().unwrap();
    let consumer = connection.current_consumer().unwrap();
    consumer.start(Some(Bytes::from_static(b"doomed\n"))).unwrap();

    let outcome = timeout(TEST_TIMEOUT, consumer.on_finished()).await.unwrap();
    assert!(outcome.is_error());

    connection.protocol().close();
    server.close().await;
}

#[tokio::test]
async fn set_timeout_replaces_the_idle_timer() {
    let server = echo_server().await;
    let addr = server.addresses()[0];

    let producer = Producer::new(
        Connection::factory(echo_factory()),
        Producer::server_events(),
        Duration::ZERO,
    );

    let connection = timeout(TEST_TIMEOUT, connect(&producer, addr)).await.unwrap().unwrap();

    // Arming twice keeps exactly one timer: the connection closes once, after
    // the second deadline.
    connection.protocol().set_timeout(Duration::from_millis(400));
    connection.protocol().set_timeout(Duration::from_millis(400));

    let outcome = timeout(Duration::from_secs(3), connection.protocol().wait_closed())
        .await
        .unwrap();
    assert!(!outcome.is_error());
    assert!(connection.protocol().is_closed());

    server.close().await;
}
