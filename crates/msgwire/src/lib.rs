//! # msgwire
//!
//! A small, symmetric, message-oriented RPC transport. A process is
//! either a [`Server`] (listens on a port, accepts many concurrent
//! peers) or a [`Client`] (connects to exactly one server); both sides
//! exchange strongly-typed messages over a TLS 1.3 stream compressed
//! with per-connection LZ4 dictionaries.
//!
//! Messages are plain serde structs tagged with a wire name via
//! [`message_type!`]. Either side registers handlers keyed by message
//! type; a handler that returns a value replies to the sender, a handler
//! that returns `()` does not. Requests take asynchronous, per-call
//! response callbacks.
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct HelloRequest {
//!     msg: String,
//! }
//! msgwire::message_type!(HelloRequest);
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct HelloResponse {
//!     msg: String,
//!     result: bool,
//! }
//! msgwire::message_type!(HelloResponse);
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = msgwire::Identity::self_signed(["localhost"])?;
//! let server = msgwire::Server::bind(msgwire::ServerOptions::new(8009), &identity).await?;
//! server.add_request_handler(|_peer, req: HelloRequest| HelloResponse {
//!     msg: format!("Received on server side: {}", req.msg),
//!     result: true,
//! })?;
//! server.start();
//!
//! let client = msgwire::Client::new();
//! client.connect("localhost", 8009, 5_000).await?;
//! client.send_request(
//!     &HelloRequest { msg: "Hello World!".into() },
//!     |res: HelloResponse| println!("{}", res.msg),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! # Wire format
//!
//! One `send` emits one length-prefixed LZ4 block whose plaintext is a
//! single MessagePack array of 2: a `[id, req_id, is_response]` routing
//! header and the message's fields in declaration order. See
//! [`packet`] and [`compress`] for the details, and [`peer`] for the
//! session state machine that keeps both directions ordered.

pub mod client;
pub mod compress;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod packet;
pub mod peer;
pub mod server;
pub mod tls;

pub use client::{Client, ConnectError};
pub use dispatcher::Dispatcher;
pub use error::Error;
pub use message::{type_hash, Message};
pub use packet::PacketInfo;
pub use peer::Peer;
pub use server::{Server, ServerOptions};
pub use tls::Identity;
