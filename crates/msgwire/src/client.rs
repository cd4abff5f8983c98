//! The connecting endpoint.
//!
//! A `Client` holds exactly one peer: the server it connected to.
//! [`connect`](Client::connect) is the only operation in the library
//! that reports failures to its caller instead of through the error
//! channels; resolution, each TCP attempt, and the TLS handshake all
//! share a single deadline given in milliseconds.

use crate::dispatcher::Dispatcher;
use crate::error::{Error, ErrorSink};
use crate::message::Message;
use crate::peer::Peer;
use crate::tls::{self, VerifyCallback};
use rustls::pki_types::{CertificateDer, InvalidDnsNameError, ServerName};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Why a [`Client::connect`] call failed. These surface synchronously to
/// the caller; everything after a successful connect goes through the
/// endpoint's error channels.
#[derive(Debug, ThisError)]
pub enum ConnectError {
    #[error("tls configuration failed: {0}")]
    Config(#[from] Error),

    #[error("timed out resolving {host}")]
    ResolveTimeout { host: String },

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },

    #[error("{host} did not resolve to any address")]
    NoAddress { host: String },

    #[error("{host} is not a valid tls server name: {source}")]
    InvalidName {
        host: String,
        source: InvalidDnsNameError,
    },

    #[error("timed out connecting to {host}:{port}")]
    ConnectTimeout { host: String, port: u16 },

    #[error("unable to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("timed out during tls handshake with {addr}")]
    HandshakeTimeout { addr: String },

    #[error("tls handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        source: std::io::Error,
    },
}

/// A connecting endpoint with a single peer.
pub struct Client {
    dispatcher: Arc<Dispatcher>,
    errors: Arc<ErrorSink>,
    verify: Mutex<Option<Arc<VerifyCallback>>>,
    peer: Mutex<Option<Arc<Peer>>>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        let errors = ErrorSink::new();
        let dispatcher = Dispatcher::new(Arc::clone(&errors));
        let (shutdown, _) = watch::channel(false);
        Self {
            dispatcher,
            errors,
            verify: Mutex::new(None),
            peer: Mutex::new(None),
            shutdown,
            worker: Mutex::new(None),
        }
    }

    /// Installs a server-certificate verification callback. Without one
    /// the client accepts any certificate; with one, the callback
    /// decides and the handshake fails when it returns false. Takes
    /// effect on the next [`connect`](Self::connect).
    pub fn set_verify_callback(
        &self,
        callback: impl Fn(&CertificateDer<'_>) -> bool + Send + Sync + 'static,
    ) {
        *self.verify.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Registers a fire-and-forget handler. See
    /// [`Dispatcher::add_handler`].
    pub fn add_handler<Req, F>(&self, handler: F) -> Result<(), Error>
    where
        Req: Message,
        F: Fn(&Arc<Peer>, Req) + Send + Sync + 'static,
    {
        self.dispatcher.add_handler(handler)
    }

    /// Registers a request/reply handler. See
    /// [`Dispatcher::add_request_handler`].
    pub fn add_request_handler<Req, Res, F>(&self, handler: F) -> Result<(), Error>
    where
        Req: Message,
        Res: Message,
        F: Fn(&Arc<Peer>, Req) -> Res + Send + Sync + 'static,
    {
        self.dispatcher.add_request_handler(handler)
    }

    /// Installs the endpoint-scoped error callback.
    pub fn on_error(&self, f: impl Fn(&Error) + Send + Sync + 'static) {
        self.errors.set_on_error(f);
    }

    /// Installs the peer-scoped error callback.
    pub fn on_peer_error(&self, f: impl Fn(&Arc<Peer>, &Error) + Send + Sync + 'static) {
        self.errors.set_on_peer_error(f);
    }

    /// Installs the callback for panics escaping user handlers.
    pub fn on_unhandled_panic(&self, f: impl Fn(&Arc<Peer>, &str) + Send + Sync + 'static) {
        self.errors.set_on_panic(f);
    }

    /// Connects to `host:port` under a single deadline of `timeout_ms`
    /// milliseconds covering resolution, TCP connect attempts, and the
    /// TLS handshake.
    ///
    /// Resolved addresses are tried in order; the first successful TCP
    /// connect proceeds to the handshake. On success the client's single
    /// peer exists and its read loop is running.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout_ms: u64,
    ) -> Result<(), ConnectError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        let config = tls::client_config(self.verify.lock().unwrap().clone())?;
        let connector = TlsConnector::from(Arc::new(config));

        // Step 1: resolve within the deadline.
        let addrs: Vec<_> = match timeout_at(deadline, lookup_host((host, port))).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(source)) => {
                return Err(ConnectError::Resolve {
                    host: host.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ConnectError::ResolveTimeout {
                    host: host.to_string(),
                })
            }
        };
        if addrs.is_empty() {
            return Err(ConnectError::NoAddress {
                host: host.to_string(),
            });
        }

        // Step 2: try each address with whatever deadline remains; the
        // first successful TCP connect wins.
        let mut last_error = None;
        let mut connected = None;
        for addr in addrs {
            match timeout_at(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    connected = Some((stream, addr));
                    break;
                }
                Ok(Err(source)) => {
                    debug!(%addr, error = %source, "connect attempt failed, trying next address");
                    last_error = Some(source);
                }
                Err(_) => {
                    return Err(ConnectError::ConnectTimeout {
                        host: host.to_string(),
                        port,
                    })
                }
            }
        }
        let Some((tcp, addr)) = connected else {
            return Err(ConnectError::Connect {
                host: host.to_string(),
                port,
                source: last_error.unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no address connected")
                }),
            });
        };

        // Step 3: TLS handshake with the remaining deadline.
        let server_name = ServerName::try_from(host.to_string()).map_err(|source| {
            ConnectError::InvalidName {
                host: host.to_string(),
                source,
            }
        })?;
        let stream = match timeout_at(deadline, connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ConnectError::Handshake {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ConnectError::HandshakeTimeout {
                    addr: addr.to_string(),
                })
            }
        };

        // Step 4: wrap the stream in the client's single peer.
        let mut worker = self.worker.lock().unwrap();
        if worker.is_none() {
            *worker = self.dispatcher.start(self.shutdown.subscribe());
        }
        drop(worker);

        let peer = Peer::spawn(
            stream,
            addr.to_string(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.errors),
        );
        if let Some(old) = self.peer.lock().unwrap().replace(Arc::clone(&peer)) {
            warn!(peer = old.address(), "replacing a previous connection");
            old.close();
        }
        info!(peer = peer.address(), "connected");
        Ok(())
    }

    /// Sends a fire-and-forget message to the server.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), Error> {
        self.current_peer()?.send(message)
    }

    /// Sends a request to the server with a typed response callback.
    pub fn send_request<Req, Res, F>(&self, message: &Req, callback: F) -> Result<(), Error>
    where
        Req: Message,
        Res: Message,
        F: FnOnce(Res) + Send + 'static,
    {
        self.current_peer()?.send_request(message, callback)
    }

    /// Whether the single peer exists and its session is open.
    pub fn is_connected(&self) -> bool {
        self.peer
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|peer| peer.is_connected())
    }

    /// The connected server's address, if any.
    pub fn address(&self) -> Option<String> {
        self.peer
            .lock()
            .unwrap()
            .as_ref()
            .map(|peer| peer.address().to_string())
    }

    /// Closes the connection and stops the dispatch worker.
    pub async fn stop(&self) {
        if let Some(peer) = self.peer.lock().unwrap().take() {
            peer.close();
        }
        let _ = self.shutdown.send(true);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    fn current_peer(&self) -> Result<Arc<Peer>, Error> {
        self.peer
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotConnected)
    }
}
