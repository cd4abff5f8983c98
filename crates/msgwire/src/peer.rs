//! One end of a live, authenticated, duplex session.
//!
//! A `Peer` comes to life right after a successful TLS handshake and is
//! shared as an `Arc`. Two tasks drive it:
//!
//! - the **read loop** owns the read half, the receive-side LZ4 state,
//!   and the envelope decoder. Only one read is outstanding at a time;
//!   the next is issued from the completion of the previous, which is
//!   all the serialization the receive state needs. Complete envelopes
//!   are posted to the endpoint's dispatch queue, never processed on the
//!   read loop itself.
//! - the **write lane** owns the write half and the send-side LZ4 state,
//!   draining an unbounded channel. Sends enqueue plaintext frames;
//!   compression and the write both happen inside the lane, so frames
//!   hit the wire in exactly the order `send` returned and nothing else
//!   ever touches the encoder state.
//!
//! # Ownership
//!
//! In-flight work keeps its peer alive, nothing else does. Both tasks
//! hold a `Weak` reference while suspended and upgrade only to process a
//! completed operation. Dropping the last application `Arc` (or calling
//! [`close`](Peer::close)) signals both tasks down, closes the stream,
//! and silently drops any pending response callbacks.

use crate::compress::{self, Compressor, Decompressor};
use crate::dispatcher::Dispatcher;
use crate::error::{panic_message, Error, ErrorSink};
use crate::message::Message;
use crate::packet::{self, EnvelopeDecoder, PacketInfo};
use rmpv::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

type ResponseCallback = Box<dyn FnOnce(Value) -> Result<(), Error> + Send>;

/// A connected remote peer. Symmetric: the server holds one per accepted
/// client, the client holds exactly one for its server.
pub struct Peer {
    address: String,
    dispatcher: Arc<Dispatcher>,
    errors: Arc<ErrorSink>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Pending-request table: correlation id to the callback that will
    /// decode and consume the response.
    requests: Mutex<HashMap<u64, ResponseCallback>>,
    /// Allocator for request correlation ids. Ids start at 1 and never
    /// recycle within a session; 0 is the fire-and-forget sentinel.
    next_request_id: AtomicU64,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
    /// Back-reference to this peer's own `Arc`, for handing strong
    /// references to error callbacks and dispatch jobs. Upgrading fails
    /// only mid-teardown, when reporting is moot anyway.
    self_weak: Weak<Peer>,
}

impl Peer {
    /// Wraps an established, authenticated stream in a peer session and
    /// starts its read loop and write lane.
    pub(crate) fn spawn<S>(
        stream: S,
        address: String,
        dispatcher: Arc<Dispatcher>,
        errors: Arc<ErrorSink>,
    ) -> Arc<Peer>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let peer = Arc::new_cyclic(|self_weak| Peer {
            address,
            dispatcher,
            errors,
            write_tx,
            requests: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            shutdown: shutdown_tx,
            self_weak: self_weak.clone(),
        });
        debug!(peer = %peer.address, "peer session started");

        tokio::spawn(read_loop(
            reader,
            Arc::downgrade(&peer),
            shutdown_rx.clone(),
        ));
        tokio::spawn(write_lane(
            writer,
            write_rx,
            Arc::downgrade(&peer),
            shutdown_rx,
        ));
        peer
    }

    /// The remote address, e.g. `127.0.0.1:8009` or `[::1]:8009`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the session is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Sends a fire-and-forget message. No response is expected and the
    /// remote handler's return value, if any, is not waited for.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), Error> {
        self.send_with(message, 0, false)
    }

    /// Sends a request and registers `callback` for its typed response.
    ///
    /// The callback is invoked at most once, on the endpoint's dispatch
    /// worker, when a response frame with this request's correlation id
    /// arrives. If the session dies first the callback is dropped
    /// without being invoked and the failure surfaces on the peer error
    /// channel instead.
    pub fn send_request<Req, Res, F>(&self, message: &Req, callback: F) -> Result<(), Error>
    where
        Req: Message,
        Res: Message,
        F: FnOnce(Res) + Send + 'static,
    {
        let req_id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let wrapped: ResponseCallback = Box::new(move |payload| {
            let res = packet::unpack::<Res>(payload)?;
            callback(res);
            Ok(())
        });

        // Insert before sending so a fast response can never race past
        // its own table entry.
        self.requests.lock().unwrap().insert(req_id, wrapped);
        match self.send_with(message, req_id, false) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.requests.lock().unwrap().remove(&req_id);
                Err(err)
            }
        }
    }

    /// Sends a response frame correlated to an incoming request. Used by
    /// the dispatcher's request/reply trampolines.
    pub(crate) fn send_response<M: Message>(&self, message: &M, req_id: u64) -> Result<(), Error> {
        self.send_with(message, req_id, true)
    }

    fn send_with<M: Message>(
        &self,
        message: &M,
        req_id: u64,
        is_response: bool,
    ) -> Result<(), Error> {
        let info = PacketInfo {
            id: M::type_hash(),
            req_id,
            is_response,
        };
        let frame = packet::encode(&info, message)?;
        trace!(
            peer = %self.address,
            name = M::NAME,
            req_id,
            is_response,
            bytes = frame.len(),
            "queueing frame"
        );
        self.send_frame(frame)
    }

    /// Enqueues one plaintext frame on the write lane.
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), Error> {
        if frame.len() > compress::BLOCK_BYTES {
            return Err(Error::PacketTooLarge { size: frame.len() });
        }
        if !self.is_connected() {
            return Err(Error::Closed);
        }
        self.write_tx.send(frame).map_err(|_| Error::Closed)
    }

    /// Closes the session: stops both tasks, closes the stream, and
    /// drops pending response callbacks. Idempotent.
    pub fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(peer = %self.address, "peer session closing");
        self.requests.lock().unwrap().clear();
        let _ = self.shutdown.send(true);
    }

    /// Reports an error on the peer channel and, when fatal, closes the
    /// session.
    pub(crate) fn fail(&self, err: Error) {
        if let Some(this) = self.self_weak.upgrade() {
            self.errors.peer_error(&this, &err);
        }
        if err.is_fatal() {
            self.close();
        }
    }

    /// Reports a non-fatal error on the peer channel.
    fn report(&self, err: &Error) {
        if let Some(this) = self.self_weak.upgrade() {
            self.errors.peer_error(&this, err);
        }
    }

    /// Hands one decoded envelope to the endpoint's dispatch queue.
    fn post_incoming(&self, value: Value) {
        let Some(peer) = self.self_weak.upgrade() else {
            return;
        };
        self.dispatcher.post(move || match packet::split(value) {
            Ok((info, payload)) => {
                if info.is_response {
                    peer.complete_request(info.req_id, payload);
                } else {
                    let dispatcher = Arc::clone(&peer.dispatcher);
                    dispatcher.dispatch(&peer, info.id, info.req_id, payload);
                }
            }
            Err(err) => peer.report(&err),
        });
    }

    /// Resolves an incoming response against the pending-request table.
    ///
    /// The entry is removed in every outcome. An unknown id surfaces
    /// `UnexpectedResponse`; a decode failure surfaces `UnpackError`; a
    /// panicking callback surfaces on the panic channel. None of them
    /// end the session.
    fn complete_request(&self, req_id: u64, payload: Value) {
        let callback = self.requests.lock().unwrap().remove(&req_id);
        let Some(callback) = callback else {
            self.report(&Error::UnexpectedResponse { req_id });
            return;
        };

        match catch_unwind(AssertUnwindSafe(move || callback(payload))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.report(&err),
            Err(panic) => {
                if let Some(this) = self.self_weak.upgrade() {
                    self.errors.unhandled_panic(&this, &panic_message(panic));
                }
            }
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// The per-peer read loop. Owns the read half, the receive-side LZ4
/// state, and the envelope decoder; holds only a `Weak` peer reference
/// while a read is suspended.
async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    weak: Weak<Peer>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut decompressor = Decompressor::new();
    let mut decoder = EnvelopeDecoder::new();

    loop {
        let result = tokio::select! {
            result = compress::read_record(&mut reader) => result,
            _ = shutdown.changed() => break,
        };
        let Some(peer) = weak.upgrade() else { break };

        match result {
            Ok(Some(block)) => {
                let plain = match decompressor.decompress(&block) {
                    Ok(plain) => plain,
                    Err(err) => {
                        peer.fail(err);
                        break;
                    }
                };
                decoder.feed(plain);
                loop {
                    match decoder.next() {
                        Ok(Some(value)) => peer.post_incoming(value),
                        Ok(None) => break,
                        // Bad envelope bytes: drop the frame, keep the
                        // session. The next block starts a fresh frame.
                        Err(err) => {
                            peer.report(&err);
                            break;
                        }
                    }
                }
            }
            Ok(None) => {
                peer.fail(Error::Closed);
                break;
            }
            Err(err) => {
                peer.fail(err);
                break;
            }
        }
    }
    trace!("read loop finished");
}

/// The per-peer write lane. Owns the write half and the send-side LZ4
/// state; frames compress and write strictly in enqueue order.
async fn write_lane<S>(
    mut writer: WriteHalf<S>,
    mut jobs: mpsc::UnboundedReceiver<Vec<u8>>,
    weak: Weak<Peer>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut compressor = Compressor::new();

    loop {
        let frame = tokio::select! {
            frame = jobs.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let block = match compressor.compress(&frame) {
            Ok(block) => block,
            Err(err) => {
                if let Some(peer) = weak.upgrade() {
                    peer.fail(err);
                }
                break;
            }
        };
        if let Err(err) = compress::write_record(&mut writer, block).await {
            if let Some(peer) = weak.upgrade() {
                peer.fail(Error::Io(err));
            }
            break;
        }
    }

    let _ = writer.shutdown().await;
    trace!("write lane finished");
}
