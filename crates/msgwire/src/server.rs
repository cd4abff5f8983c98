//! The listening endpoint.
//!
//! A `Server` binds a TCP listener, performs the server-side TLS
//! handshake on each accepted socket, and wraps the result in a
//! [`Peer`]. One accept is outstanding at a time; the next is issued
//! once the previous connection is handed off.
//!
//! # Peer lifetime
//!
//! The server does not retain accepted peers. The
//! [`on_accept_success`](Server::on_accept_success) hook is the
//! application's one chance to keep a peer alive; a peer nobody holds is
//! torn down as soon as its in-flight work drains. The server keeps only
//! `Weak` bookkeeping so [`stop`](Server::stop) can close the sessions
//! that are still live.

use crate::dispatcher::Dispatcher;
use crate::error::{Error, ErrorSink};
use crate::message::Message;
use crate::peer::Peer;
use crate::tls::{self, Identity};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

type AcceptHook = Arc<dyn Fn(Arc<Peer>) + Send + Sync>;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// TCP port to listen on. 0 lets the OS assign one; query it with
    /// [`Server::port`].
    pub port: u16,
    /// Bind the IPv6 wildcard address instead of the IPv4 one.
    pub ipv6: bool,
}

impl ServerOptions {
    pub fn new(port: u16) -> Self {
        Self { port, ipv6: false }
    }
}

/// A listening endpoint accepting many concurrent peers.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    errors: Arc<ErrorSink>,
    acceptor: TlsAcceptor,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    on_accept: Arc<Mutex<Option<AcceptHook>>>,
    accepted: Arc<Mutex<Vec<Weak<Peer>>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Binds the TCP listener and builds the TLS acceptor. Call
    /// [`start`](Self::start) to begin accepting.
    pub async fn bind(options: ServerOptions, identity: &Identity) -> Result<Self, Error> {
        let addr: SocketAddr = if options.ipv6 {
            (std::net::Ipv6Addr::UNSPECIFIED, options.port).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, options.port).into()
        };
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let acceptor = TlsAcceptor::from(tls::server_config(identity)?);
        info!(addr = %local_addr, "server listening");

        let errors = ErrorSink::new();
        let dispatcher = Dispatcher::new(Arc::clone(&errors));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            dispatcher,
            errors,
            acceptor,
            listener: Mutex::new(Some(listener)),
            local_addr,
            on_accept: Arc::new(Mutex::new(None)),
            accepted: Arc::new(Mutex::new(Vec::new())),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The bound address. Useful with port 0 to learn the assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
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

    /// Installs the hook invoked with every newly accepted peer. This is
    /// the application's point to retain peers; the server itself keeps
    /// no strong references.
    pub fn on_accept_success(&self, hook: impl Fn(Arc<Peer>) + Send + Sync + 'static) {
        *self.on_accept.lock().unwrap() = Some(Arc::new(hook));
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

    /// Starts the accept loop and the dispatch worker. Idempotent.
    pub fn start(&self) {
        let Some(listener) = self.listener.lock().unwrap().take() else {
            return;
        };
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(worker) = self.dispatcher.start(self.shutdown.subscribe()) {
            tasks.push(worker);
        }
        tasks.push(tokio::spawn(accept_loop(
            listener,
            self.acceptor.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.errors),
            Arc::clone(&self.on_accept),
            Arc::clone(&self.accepted),
            self.shutdown.subscribe(),
        )));
    }

    /// Stops accepting, closes every live accepted peer, and waits for
    /// the endpoint's tasks to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        for weak in self.accepted.lock().unwrap().drain(..) {
            if let Some(peer) = weak.upgrade() {
                peer.close();
            }
        }
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(addr = %self.local_addr, "server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    dispatcher: Arc<Dispatcher>,
    errors: Arc<ErrorSink>,
    on_accept: Arc<Mutex<Option<AcceptHook>>>,
    accepted: Arc<Mutex<Vec<Weak<Peer>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let conn = tokio::select! {
            conn = listener.accept() => conn,
            _ = shutdown.changed() => break,
        };
        match conn {
            Ok((tcp, remote)) => {
                debug!(peer = %remote, "accepted tcp connection");
                let handshake = tokio::select! {
                    handshake = acceptor.accept(tcp) => handshake,
                    _ = shutdown.changed() => break,
                };
                match handshake {
                    Ok(stream) => {
                        let peer = Peer::spawn(
                            stream,
                            remote.to_string(),
                            Arc::clone(&dispatcher),
                            Arc::clone(&errors),
                        );
                        {
                            let mut accepted = accepted.lock().unwrap();
                            accepted.retain(|weak| weak.strong_count() > 0);
                            accepted.push(Arc::downgrade(&peer));
                        }
                        info!(peer = %peer.address(), "peer connected");
                        let hook = on_accept.lock().unwrap().clone();
                        if let Some(hook) = hook {
                            hook(peer);
                        }
                    }
                    Err(e) => errors.endpoint_error(&Error::Handshake(e)),
                }
            }
            Err(e) => {
                // Accept errors are usually transient (file descriptor
                // exhaustion and the like); report and keep going.
                error!(error = %e, "failed to accept tcp connection");
                errors.endpoint_error(&Error::Io(e));
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_start_stop() {
        let identity = Identity::self_signed(["localhost"]).unwrap();
        let server = Server::bind(ServerOptions::new(0), &identity).await.unwrap();
        assert_ne!(server.port(), 0);

        server.start();
        // Starting twice is harmless.
        server.start();
        server.stop().await;
    }

    #[tokio::test]
    async fn ipv6_bind() {
        let identity = Identity::self_signed(["localhost"]).unwrap();
        let options = ServerOptions {
            port: 0,
            ipv6: true,
        };
        let server = Server::bind(options, &identity).await.unwrap();
        assert!(server.local_addr().is_ipv6());
        server.stop().await;
    }
}
