//! msgwire demo: a server and a client in one process.
//!
//! ```bash
//! msgwire-hello                    # run on the default port 8009
//! msgwire-hello --port 9000       # pick another port
//! MSGWIRE_LOG=debug msgwire-hello  # watch the frames fly
//! ```
//!
//! The flow:
//! 1. Start a server with a self-signed identity and a
//!    `HelloRequest -> HelloResponse` handler.
//! 2. Connect a client and send `HelloRequest { msg: "Hello World!" }`.
//! 3. Print the typed response from the per-call callback.
//! 4. Have the server push `Foo { data: 42 }` back to the client's
//!    no-reply handler.
//! 5. Stop both endpoints.

use anyhow::{Context, Result};
use clap::Parser;
use msgwire::{Client, Identity, Peer, Server, ServerOptions};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

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

/// msgwire demo: a server and a client exchanging typed messages.
#[derive(Parser, Debug)]
#[command(name = "msgwire-hello", about = "msgwire hello-world demo")]
struct Cli {
    /// TCP port for the demo server.
    #[arg(short, long, default_value = "8009")]
    port: u16,

    /// Connect timeout in milliseconds.
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    // -----------------------------------------------------------------------
    // Server
    // -----------------------------------------------------------------------
    let identity = Identity::self_signed(["localhost"])?;
    let server = Server::bind(ServerOptions::new(cli.port), &identity)
        .await
        .context("failed to bind demo server")?;

    // The server retains nothing; the accept hook is where the
    // application keeps peers alive.
    let peers: Arc<Mutex<Vec<Arc<Peer>>>> = Arc::new(Mutex::new(Vec::new()));
    let peers_in_hook = Arc::clone(&peers);
    server.on_accept_success(move |peer| {
        info!(peer = peer.address(), "server accepted a peer");
        peers_in_hook.lock().unwrap().push(peer);
    });

    server.add_request_handler(|_peer, req: HelloRequest| HelloResponse {
        msg: format!("Received on server side: {}", req.msg),
        result: true,
    })?;

    server.start();
    info!(port = server.port(), "server started");

    // -----------------------------------------------------------------------
    // Client
    // -----------------------------------------------------------------------
    let client = Client::new();

    // The server may push Foo at any time; no response goes back.
    client.add_handler(|_peer, req: Foo| {
        println!("Received foo data: {}", req.data);
    })?;

    client
        .connect("localhost", server.port(), cli.timeout_ms)
        .await
        .context("failed to connect to the demo server")?;
    info!(addr = %client.address().unwrap_or_default(), "client connected");

    // Request/response with a per-call callback.
    let (tx, rx) = tokio::sync::oneshot::channel();
    println!("Sending request to the server");
    client.send_request(
        &HelloRequest {
            msg: "Hello World!".to_string(),
        },
        move |res: HelloResponse| {
            let _ = tx.send(res);
        },
    )?;

    let res = tokio::time::timeout(Duration::from_millis(100), rx)
        .await
        .context("no response within 100ms")??;
    println!("Received response from the server: {}", res.msg);

    // The server talks back through the peer it retained in the hook.
    let server_peer = peers
        .lock()
        .unwrap()
        .first()
        .cloned()
        .context("server retained no peer")?;
    server_peer.send(&Foo { data: 42 })?;

    // Give the push a moment to arrive before shutting down.
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.stop().await;
    server.stop().await;
    info!("demo finished");
    Ok(())
}

/// Initializes tracing. The `MSGWIRE_LOG` env var controls the level
/// (default: info).
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_env("MSGWIRE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
