//! End-to-end transport tests.
//!
//! Runs the server on a real TCP listener (port 0) and talks to it with the
//! library client.

use std::time::Duration;

use netconf::config::Config;
use netconf::dispatch::{handler_fn, OperationOutput, OperationResult};
use netconf::protocol::{OperationName, ReplyContent};
use netconf::registry::MonitoringEvent;
use netconf::transport::{connect, TcpTransport};
use netconf::{ClientOptions, FramingMode, NetconfError, NetconfServer};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(5);

fn echo_server() -> NetconfServer {
    NetconfServer::builder(Config::default())
        .with_operation(
            OperationName::base("get"),
            handler_fn(|req, _prev| async move {
                let filter = req.parameter("filter").ok().flatten().unwrap_or_default();
                OperationResult::Ok(OperationOutput::Data(format!("<data>{filter}</data>")))
            }),
        )
        .build()
        .unwrap()
}

/// Test a client round trip over TCP and a clean listener shutdown
#[tokio::test]
async fn test_tcp_round_trip_and_shutdown() {
    let server = echo_server();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serving = tokio::spawn(TcpTransport::serve_listener(
        listener,
        server.clone(),
        async move {
            let _ = stop_rx.await;
        },
    ));

    let client = connect(addr, ClientOptions::default()).await.unwrap();
    assert_eq!(client.framing(), FramingMode::Chunked);
    assert!(client.session_id() >= 1);

    let reply = client.rpc("<get><filter>ifaces</filter></get>").await.unwrap();
    assert!(matches!(reply.content, ReplyContent::Data(d) if d.contains("ifaces")));

    // a large reply crosses several outbound chunks
    let big = "x".repeat(64 * 1024);
    let reply = client
        .rpc(&format!("<get><filter>{big}</filter></get>"))
        .await
        .unwrap();
    assert!(matches!(reply.content, ReplyContent::Data(d) if d.len() > big.len()));

    client.close().await.unwrap();

    let _ = stop_tx.send(());
    tokio::time::timeout(WAIT, serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(server.registry().is_closed().await);
}

/// Test that stopping the listener closes live sessions
#[tokio::test]
async fn test_listener_stop_closes_sessions() {
    let server = echo_server();
    let mut events = server.registry().subscribe().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serving = tokio::spawn(TcpTransport::serve_listener(
        listener,
        server.clone(),
        async move {
            let _ = stop_rx.await;
        },
    ));

    let client = connect(addr, ClientOptions::default()).await.unwrap();
    loop {
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let MonitoringEvent::SessionStarted(info) = event {
            assert_eq!(info.session_id, client.session_id());
            assert_eq!(info.transport, "tcp");
            break;
        }
    }

    let _ = stop_tx.send(());
    tokio::time::timeout(WAIT, serving).await.unwrap().unwrap().unwrap();
    tokio::time::timeout(WAIT, client.closed()).await.unwrap();

    assert!(matches!(
        client.rpc("<get/>").await,
        Err(NetconfError::SessionClosed)
    ));
}

/// Test connecting to a port nobody listens on
#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = connect(addr, ClientOptions::default()).await.unwrap_err();
    assert!(matches!(err, NetconfError::Io(_)));
}
