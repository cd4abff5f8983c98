//! Handler registry and the endpoint's dispatch queue.
//!
//! Handlers are registered per message type before the endpoint starts
//! and are immutable afterwards. Registration is strongly typed: the
//! registry stores, for each type hash, a type-erased trampoline built at
//! registration time that embeds the decoder for the request type, the
//! user's function, and (for request/reply handlers) the reply send.
//!
//! Incoming frames are not processed on the peer's read loop. The read
//! loop posts a closure to the endpoint's dispatch queue, a single worker
//! task draining an unbounded channel, so decoding and handler execution
//! happen off the I/O path and frames from one peer run in arrival
//! order.

use crate::error::{panic_message, Error, ErrorSink};
use crate::message::Message;
use crate::packet;
use crate::peer::Peer;
use rmpv::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type HandlerFn = dyn Fn(&Arc<Peer>, u64, Value) -> Result<(), Error> + Send + Sync;
type DispatchJob = Box<dyn FnOnce() + Send>;

struct Registered {
    name: &'static str,
    handler: Arc<HandlerFn>,
}

/// Type-hash indexed handler registry plus the FIFO execution queue
/// shared by every peer of one endpoint.
pub struct Dispatcher {
    errors: Arc<ErrorSink>,
    handlers: RwLock<HashMap<u64, Registered>>,
    queue_tx: mpsc::UnboundedSender<DispatchJob>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<DispatchJob>>>,
}

impl Dispatcher {
    pub(crate) fn new(errors: Arc<ErrorSink>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            errors,
            handlers: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        })
    }

    /// Registers a fire-and-forget handler for `Req`. The handler's
    /// return is `()`: no reply frame is emitted.
    pub fn add_handler<Req, F>(&self, handler: F) -> Result<(), Error>
    where
        Req: Message,
        F: Fn(&Arc<Peer>, Req) + Send + Sync + 'static,
    {
        self.insert::<Req>(Arc::new(move |peer, _req_id, payload| {
            let req = packet::unpack::<Req>(payload)?;
            handler(peer, req);
            Ok(())
        }))
    }

    /// Registers a request/reply handler for `Req`. The returned `Res` is
    /// sent back to the requesting peer as a response frame carrying the
    /// incoming request id.
    pub fn add_request_handler<Req, Res, F>(&self, handler: F) -> Result<(), Error>
    where
        Req: Message,
        Res: Message,
        F: Fn(&Arc<Peer>, Req) -> Res + Send + Sync + 'static,
    {
        self.insert::<Req>(Arc::new(move |peer, req_id, payload| {
            let req = packet::unpack::<Req>(payload)?;
            let res = handler(peer, req);
            peer.send_response(&res, req_id)
        }))
    }

    fn insert<Req: Message>(&self, handler: Arc<HandlerFn>) -> Result<(), Error> {
        let mut handlers = self.handlers.write().unwrap();
        let hash = Req::type_hash();
        if let Some(existing) = handlers.get(&hash) {
            // Same hash for a different name would be a collision rather
            // than a double registration; either way the binding is taken.
            return Err(Error::DuplicateHandler {
                name: existing.name,
            });
        }
        debug!(name = Req::NAME, hash, "handler registered");
        handlers.insert(
            hash,
            Registered {
                name: Req::NAME,
                handler,
            },
        );
        Ok(())
    }

    /// Enqueues a closure on the endpoint's execution context. Posts run
    /// in order on the single dispatch worker.
    pub(crate) fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.queue_tx.send(Box::new(job)).is_err() {
            trace!("dispatch queue closed, dropping job");
        }
    }

    /// Spawns the dispatch worker. Returns `None` if it was already
    /// started for this endpoint.
    pub(crate) fn start(&self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let mut queue_rx = self.queue_rx.lock().unwrap().take()?;
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    job = queue_rx.recv() => match job {
                        Some(job) => job(),
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }))
    }

    /// Routes one incoming request frame.
    ///
    /// Unknown type: `UnexpectedRequest`, frame dropped. Decode failure:
    /// `UnpackError`, frame dropped. A panic escaping the user handler is
    /// caught and reported; none of these end the session.
    pub(crate) fn dispatch(&self, peer: &Arc<Peer>, id: u64, req_id: u64, payload: Value) {
        let handler = self
            .handlers
            .read()
            .unwrap()
            .get(&id)
            .map(|r| Arc::clone(&r.handler));
        let Some(handler) = handler else {
            self.errors
                .peer_error(peer, &Error::UnexpectedRequest { type_hash: id });
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(peer, req_id, payload))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.errors.peer_error(peer, &err),
            Err(payload) => self
                .errors
                .unhandled_panic(peer, &panic_message(payload)),
        }
    }
}
