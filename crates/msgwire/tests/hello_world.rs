//! End-to-end scenarios over real TLS on localhost.
//!
//! Each test stands up a server with a self-signed identity on an
//! OS-assigned port and connects a real client to it, mirroring the
//! hello-world flow the demo binary ships.

use msgwire::{Client, Identity, Peer, Server, ServerOptions};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct HelloRequest {
    msg: String,
}

msgwire::message_type!(HelloRequest);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct HelloResponse {
    msg: String,
    result: bool,
}

msgwire::message_type!(HelloResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Foo {
    data: i32,
}

msgwire::message_type!(Foo);

/// Peers accepted by the server, kept alive the way the acceptance hook
/// is meant to be used.
type PeerSet = Arc<Mutex<Vec<Arc<Peer>>>>;

async fn start_server() -> (Server, PeerSet) {
    let identity = Identity::self_signed(["localhost"]).unwrap();
    let server = Server::bind(ServerOptions::new(0), &identity)
        .await
        .unwrap();

    let peers: PeerSet = Arc::new(Mutex::new(Vec::new()));
    let peers_in_hook = Arc::clone(&peers);
    server.on_accept_success(move |peer| {
        peers_in_hook.lock().unwrap().push(peer);
    });
    (server, peers)
}

#[tokio::test]
async fn hello_roundtrip_and_server_push() {
    let (server, peers) = start_server().await;
    server
        .add_request_handler(|_peer, req: HelloRequest| HelloResponse {
            msg: format!("Received on server side: {}", req.msg),
            result: true,
        })
        .unwrap();
    server.start();

    let client = Client::new();

    // The client handles Foo pushes from the server with no reply.
    let (foo_tx, mut foo_rx) = mpsc::unbounded_channel();
    client
        .add_handler(move |_peer, req: Foo| {
            let _ = foo_tx.send(req.data);
        })
        .unwrap();

    // Any frame the client would send back for Foo would surface as an
    // unexpected response on the server; record everything to prove
    // silence.
    let (server_err_tx, mut server_err_rx) = mpsc::unbounded_channel();
    server.on_peer_error(move |_peer, err| {
        let _ = server_err_tx.send(err.to_string());
    });

    client
        .connect("localhost", server.port(), 5_000)
        .await
        .unwrap();
    assert!(client.is_connected());

    // Scenario 1: request/response round-trip within 100 ms.
    let (tx, rx) = oneshot::channel();
    client
        .send_request(
            &HelloRequest {
                msg: "Hello World!".to_string(),
            },
            move |res: HelloResponse| {
                let _ = tx.send(res);
            },
        )
        .unwrap();

    let res = timeout(Duration::from_millis(100), rx)
        .await
        .expect("response within 100ms")
        .unwrap();
    assert_eq!(
        res,
        HelloResponse {
            msg: "Received on server side: Hello World!".to_string(),
            result: true,
        }
    );

    // The hook retained exactly one peer.
    let server_peer = {
        let peers = peers.lock().unwrap();
        assert_eq!(peers.len(), 1);
        Arc::clone(&peers[0])
    };

    // Scenario 2: the server pushes Foo to the client; the client's
    // no-reply handler sees it and nothing comes back on the wire.
    server_peer.send(&Foo { data: 42 }).unwrap();
    let data = timeout(Duration::from_millis(500), foo_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data, 42);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        server_err_rx.try_recv().is_err(),
        "server saw an unexpected frame"
    );

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn request_without_handler_surfaces_unexpected_request() {
    let (server, _peers) = start_server().await;

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    server.on_peer_error(move |_peer, err| {
        let _ = err_tx.send(err.to_string());
    });
    server.start();

    let client = Client::new();
    client
        .connect("localhost", server.port(), 5_000)
        .await
        .unwrap();

    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_in_cb = Arc::clone(&invoked);
    client
        .send_request(
            &HelloRequest {
                msg: "anyone?".to_string(),
            },
            move |_res: HelloResponse| {
                invoked_in_cb.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    let err = timeout(Duration::from_millis(500), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(err.contains("no handler registered"), "got: {err}");

    // The callback never fired and the connection stayed open.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert!(client.is_connected());

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn duplicate_handler_registration_fails() {
    let client = Client::new();
    client
        .add_handler(|_peer, _req: Foo| {})
        .unwrap();

    let second = client.add_request_handler(|_peer, req: Foo| HelloResponse {
        msg: format!("{}", req.data),
        result: false,
    });
    assert!(matches!(
        second,
        Err(msgwire::Error::DuplicateHandler { name: "Foo" })
    ));
}

#[tokio::test]
async fn server_stop_fails_in_flight_request_via_error_channel() {
    let (server, _peers) = start_server().await;

    // The server accepts the request but never answers it.
    server.add_handler(|_peer, _req: HelloRequest| {}).unwrap();
    server.start();

    let client = Client::new();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    client.on_peer_error(move |_peer, err| {
        let _ = err_tx.send(err.to_string());
    });

    client
        .connect("localhost", server.port(), 5_000)
        .await
        .unwrap();

    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_in_cb = Arc::clone(&invoked);
    client
        .send_request(
            &HelloRequest {
                msg: "going down".to_string(),
            },
            move |_res: HelloResponse| {
                invoked_in_cb.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.stop().await;

    let err = timeout(Duration::from_secs(1), err_rx.recv())
        .await
        .expect("client observes the shutdown")
        .unwrap();
    assert!(
        err.contains("closed") || err.contains("i/o"),
        "got: {err}"
    );
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert!(!client.is_connected());

    client.stop().await;
}

#[tokio::test]
async fn verify_callback_accepts_and_rejects() {
    let (server, _peers) = start_server().await;
    server.start();

    // A callback that accepts whatever certificate is presented.
    let accepting = Client::new();
    accepting.set_verify_callback(|_cert| true);
    accepting
        .connect("localhost", server.port(), 5_000)
        .await
        .unwrap();
    assert!(accepting.is_connected());
    accepting.stop().await;

    // A callback that rejects everything fails the handshake.
    let rejecting = Client::new();
    rejecting.set_verify_callback(|_cert| false);
    let err = rejecting
        .connect("localhost", server.port(), 5_000)
        .await
        .unwrap_err();
    assert!(matches!(err, msgwire::ConnectError::Handshake { .. }));
    assert!(!rejecting.is_connected());

    server.stop().await;
}

#[tokio::test]
async fn two_clients_converse_with_one_server() {
    let (server, peers) = start_server().await;
    server
        .add_request_handler(|_peer, req: HelloRequest| HelloResponse {
            msg: format!("echo: {}", req.msg),
            result: true,
        })
        .unwrap();
    server.start();

    let mut clients = Vec::new();
    for i in 0..2 {
        let client = Client::new();
        client
            .connect("localhost", server.port(), 5_000)
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        client
            .send_request(
                &HelloRequest {
                    msg: format!("client {i}"),
                },
                move |res: HelloResponse| {
                    let _ = tx.send(res);
                },
            )
            .unwrap();
        let res = timeout(Duration::from_millis(500), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.msg, format!("echo: client {i}"));
        clients.push(client);
    }

    assert_eq!(peers.lock().unwrap().len(), 2);

    for client in &clients {
        client.stop().await;
    }
    server.stop().await;
}
