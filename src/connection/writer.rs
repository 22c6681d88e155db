//! Non-blocking write path.
//!
//! Sends are attempted inline on the caller's thread while the kernel accepts
//! bytes. A partial write promotes the connection to buffered mode: the
//! residue is queued and a drain task services write-readiness until the
//! queue empties, at which point inline sends resume. One mutex serializes
//! every sender with the drain task, so bytes hit the wire in submission
//! order.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Outcome of a [`ConnectionWriter::send`] call.
#[derive(Debug)]
pub enum SendResult {
    /// The payload was written inline in its entirety.
    Success,
    /// The payload (or its residue) was queued behind write-readiness.
    Buffered { accepted: usize, queued: usize },
    /// The connection is closed; nothing was written.
    Closed,
    /// Nothing was written. On a socket I/O failure the connection is being
    /// torn down; on an invalid payload (`InvalidInput`) it stays up.
    FailedOnError { cause: io::Error },
}

impl SendResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SendResult::Success)
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self, SendResult::Buffered { .. })
    }
}

/// Write side of a socket, reduced to the operations the writer needs.
///
/// Kept object-safe so tests can script partial acceptance and stalls.
pub trait SendStream: Send + Sync + 'static {
    /// Attempts a single non-blocking write, returning the number of bytes
    /// accepted. `WouldBlock` means the kernel buffer is full.
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Resolves when the stream may accept more bytes.
    fn writable(&self) -> BoxFuture<'_, io::Result<()>>;
}

impl SendStream for OwnedWriteHalf {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        OwnedWriteHalf::try_write(self, buf)
    }

    fn writable(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(OwnedWriteHalf::writable(self))
    }
}

/// Bytes awaiting write-readiness. At most one exists per connection.
struct BufferedWrite {
    queue: BytesMut,
}

struct WriteState {
    /// `None` once the connection is closed; dropping the last stream handle
    /// sends FIN.
    stream: Option<Arc<dyn SendStream>>,
    buffered: Option<BufferedWrite>,
    close_on_drain: bool,
}

struct WriterInner {
    state: Mutex<WriteState>,
    shutdown: CancellationToken,
    handle: Handle,
}

/// Thread-safe, non-blocking writer for one connection.
#[derive(Clone)]
pub struct ConnectionWriter {
    inner: Arc<WriterInner>,
}

impl ConnectionWriter {
    /// `shutdown` is the connection's teardown token: cancelling it wakes the
    /// read task, which runs close callbacks and releases the socket.
    pub fn new(stream: Arc<dyn SendStream>, shutdown: CancellationToken, handle: Handle) -> Self {
        let state = WriteState { stream: Some(stream), buffered: None, close_on_drain: false };
        Self { inner: Arc::new(WriterInner { state: Mutex::new(state), shutdown, handle }) }
    }

    /// Sends a payload: inline while the kernel accepts bytes, queued behind
    /// write-readiness otherwise. Never blocks on network I/O.
    pub fn send(&self, payload: Bytes) -> SendResult {
        let mut state = self.inner.state.lock().unwrap();

        let Some(stream) = state.stream.clone() else {
            return SendResult::Closed;
        };

        if let Some(buffered) = &mut state.buffered {
            let accepted = payload.len();
            buffered.queue.extend_from_slice(&payload);
            return SendResult::Buffered { accepted, queued: buffered.queue.len() };
        }

        let mut payload = payload;
        while !payload.is_empty() {
            match stream.try_write(&payload) {
                Ok(0) => break,
                Ok(n) => payload.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(cause) => {
                    warn!(%cause, "inline write failed, closing connection");
                    state.stream = None;
                    state.buffered = None;
                    drop(state);
                    self.inner.shutdown.cancel();
                    return SendResult::FailedOnError { cause };
                }
            }
        }

        if payload.is_empty() {
            return SendResult::Success;
        }

        // kernel buffer saturated: queue the residue and hand off to a
        // write-readiness drain task
        let queued = payload.len();
        state.buffered = Some(BufferedWrite { queue: BytesMut::from(&payload[..]) });
        drop(state);

        trace!(queued, "promoting to buffered write");
        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(drain(inner));

        SendResult::Buffered { accepted: queued, queued }
    }

    /// Closes the connection immediately. Queued bytes are dropped and the
    /// read task is woken to run teardown.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.stream = None;
            state.buffered = None;
        }
        self.inner.shutdown.cancel();
    }

    /// Closes once every queued byte has reached the kernel. Used for
    /// `Connection: close` responses, where the response must not be cut off.
    pub(crate) fn close_when_drained(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.buffered.is_some() {
                state.close_on_drain = true;
                return;
            }
            state.stream = None;
        }
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().stream.is_none()
    }

    /// True while a buffered write is outstanding.
    pub fn is_buffered(&self) -> bool {
        self.inner.state.lock().unwrap().buffered.is_some()
    }
}

enum DrainStep {
    Drained { close: bool },
    NotReady,
    Failed(io::Error),
}

/// Services write-readiness for the buffered queue. Runs until the queue
/// drains or the connection dies; the slot is cleared under the writer mutex
/// so a new inline send can only race in after the drain completed.
async fn drain(inner: Arc<WriterInner>) {
    loop {
        let Some(stream) = inner.state.lock().unwrap().stream.clone() else {
            return;
        };

        let ready = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            ready = stream.writable() => ready,
        };
        if let Err(cause) = ready {
            fail(&inner, cause);
            return;
        }

        let step = {
            let mut state = inner.state.lock().unwrap();
            let Some(buffered) = state.buffered.as_mut() else {
                return;
            };

            let mut step = DrainStep::NotReady;
            loop {
                if buffered.queue.is_empty() {
                    step = DrainStep::Drained { close: false };
                    break;
                }
                match stream.try_write(&buffered.queue) {
                    Ok(0) => break,
                    Ok(n) => buffered.queue.advance(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(cause) => {
                        step = DrainStep::Failed(cause);
                        break;
                    }
                }
            }

            match &mut step {
                DrainStep::Drained { close } => {
                    // buffer end: clear the slot so inline sends resume
                    state.buffered = None;
                    if state.close_on_drain {
                        state.stream = None;
                        *close = true;
                    }
                }
                DrainStep::Failed(_) => {
                    state.stream = None;
                    state.buffered = None;
                }
                DrainStep::NotReady => {}
            }
            step
        };

        match step {
            DrainStep::Drained { close } => {
                trace!("buffered write drained");
                if close {
                    inner.shutdown.cancel();
                }
                return;
            }
            DrainStep::Failed(cause) => {
                warn!(%cause, "buffered write failed, closing connection");
                inner.shutdown.cancel();
                return;
            }
            DrainStep::NotReady => {}
        }
    }
}

/// Buffered-write failures are never silent: tear the connection down so the
/// read task surfaces `on_error` and `on_close` to the handler.
fn fail(inner: &Arc<WriterInner>, cause: io::Error) {
    warn!(%cause, "buffered write failed, closing connection");
    {
        let mut state = inner.state.lock().unwrap();
        state.stream = None;
        state.buffered = None;
    }
    inner.shutdown.cancel();
}
