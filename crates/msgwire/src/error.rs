//! Error taxonomy and the per-endpoint error channels.
//!
//! Most failures in this library are asynchronous: they happen on a peer's
//! read loop or write lane, long after the call that caused them returned.
//! Those are reported through the [`ErrorSink`] callbacks an application
//! installs on its endpoint. Only a handful of failures surface
//! synchronously: handler registration, oversized sends, and the client's
//! `connect` (which has its own error type, `ConnectError`).
//!
//! Fatal errors close the peer; non-fatal ones drop the offending frame
//! and leave the session running. [`Error::is_fatal`] encodes the split.

use crate::peer::Peer;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{error, warn};

/// Everything that can go wrong on a live endpoint or peer session.
#[derive(Debug, Error)]
pub enum Error {
    /// The TLS handshake with an incoming connection failed.
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// A response frame arrived for a request id we are not waiting on.
    #[error("response arrived with unknown request id {req_id}")]
    UnexpectedResponse { req_id: u64 },

    /// An inbound frame was not a well-formed `[header, payload]` envelope.
    #[error("message envelope was not a [header, payload] pair")]
    BadMessageFormat,

    /// A request frame arrived for a type no handler is registered for.
    #[error("no handler registered for message type {type_hash:#018x}")]
    UnexpectedRequest { type_hash: u64 },

    /// A payload failed to decode into the expected message type.
    #[error("failed to decode message payload: {0}")]
    Unpack(String),

    /// The inbound LZ4 stream is corrupt or out of sync.
    #[error("lz4 stream is corrupt or out of sync")]
    Decompress,

    /// A frame too large for a single compression block was rejected at
    /// `send`. The session is unaffected.
    #[error("unable to compress packet: {size} bytes exceeds the 8192 byte block")]
    PacketTooLarge { size: usize },

    /// LZ4 failed to compress an outbound block.
    #[error("unable to compress packet")]
    Compress,

    /// A message failed to serialize into its envelope.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A second handler was registered for an already-bound message type.
    #[error("a handler for message type `{name}` is already registered")]
    DuplicateHandler { name: &'static str },

    /// A send was attempted while no peer connection exists.
    #[error("not connected")]
    NotConnected,

    /// The remote side closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// A TLS configuration step failed.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// A certificate or private key could not be built or parsed.
    #[error("failed to build tls identity: {0}")]
    Identity(String),

    /// An underlying transport error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error tears down the peer session. Non-fatal errors
    /// drop the offending frame and keep reading.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Handshake(_)
                | Error::Decompress
                | Error::Compress
                | Error::Closed
                | Error::Io(_)
        )
    }
}

type EndpointErrorFn = dyn Fn(&Error) + Send + Sync;
type PeerErrorFn = dyn Fn(&Arc<Peer>, &Error) + Send + Sync;
type PanicFn = dyn Fn(&Arc<Peer>, &str) + Send + Sync;

/// The settable error callbacks shared by an endpoint and all its peers.
///
/// Three channels, mirroring the three places failures originate:
/// endpoint-scoped errors (accept failures, handshake failures),
/// peer-scoped errors (everything in the [`Error`] taxonomy that happens
/// on a live session), and panics escaping user handlers or response
/// callbacks. Without an installed callback each channel logs through
/// `tracing`, so a bare endpoint is still observable.
pub struct ErrorSink {
    on_error: RwLock<Option<Box<EndpointErrorFn>>>,
    on_peer_error: RwLock<Option<Box<PeerErrorFn>>>,
    on_panic: RwLock<Option<Box<PanicFn>>>,
}

impl ErrorSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            on_error: RwLock::new(None),
            on_peer_error: RwLock::new(None),
            on_panic: RwLock::new(None),
        })
    }

    pub(crate) fn set_on_error(&self, f: impl Fn(&Error) + Send + Sync + 'static) {
        *self.on_error.write().unwrap() = Some(Box::new(f));
    }

    pub(crate) fn set_on_peer_error(&self, f: impl Fn(&Arc<Peer>, &Error) + Send + Sync + 'static) {
        *self.on_peer_error.write().unwrap() = Some(Box::new(f));
    }

    pub(crate) fn set_on_panic(&self, f: impl Fn(&Arc<Peer>, &str) + Send + Sync + 'static) {
        *self.on_panic.write().unwrap() = Some(Box::new(f));
    }

    /// Reports an endpoint-scoped error.
    pub(crate) fn endpoint_error(&self, err: &Error) {
        match &*self.on_error.read().unwrap() {
            Some(cb) => cb(err),
            None => error!(error = %err, "endpoint error"),
        }
    }

    /// Reports a peer-scoped error.
    pub(crate) fn peer_error(&self, peer: &Arc<Peer>, err: &Error) {
        match &*self.on_peer_error.read().unwrap() {
            Some(cb) => cb(peer, err),
            None if err.is_fatal() => error!(peer = peer.address(), error = %err, "peer error"),
            None => warn!(peer = peer.address(), error = %err, "peer error"),
        }
    }

    /// Reports a panic caught while running a user handler or callback.
    pub(crate) fn unhandled_panic(&self, peer: &Arc<Peer>, message: &str) {
        match &*self.on_panic.read().unwrap() {
            Some(cb) => cb(peer, message),
            None => error!(peer = peer.address(), panic = message, "handler panicked"),
        }
    }
}

/// Renders a caught panic payload into a printable message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
