//! WebSocket connection facade.
//!
//! The facade owned by handler callbacks: outbound frame encoding over the
//! connection writer, the close protocol, session-scoped disposables, and
//! timer scheduling that is suppressed once the connection has closed.

mod handler;

pub use handler::{WebSocketHandler, WsEndpoint};
pub(crate) use handler::{FiberEndpoint, InlineEndpoint};

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::error;

use crate::codec::encode_frame;
use crate::connection::{ConnectionWriter, SendResult};
use crate::protocol::{HttpRequest, Opcode};
use crate::session::TaskExecutor;

/// A handle whose disposal cancels a scheduled task or releases a resource
/// exactly once. Cloned handles share the same underlying action.
#[derive(Clone)]
pub struct Disposable {
    inner: Arc<DisposableInner>,
}

struct DisposableInner {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Disposable {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self { inner: Arc::new(DisposableInner { action: Mutex::new(Some(Box::new(action))) }) }
    }

    /// Runs the action on first call; later calls are no-ops.
    pub fn dispose(&self) {
        let action = self.inner.action.lock().unwrap().take();
        if let Some(action) = action {
            action();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.action.lock().unwrap().is_none()
    }

    fn ptr_eq(&self, other: &Disposable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

struct FacadeState {
    closed: bool,
    disposables: Vec<Disposable>,
}

struct FacadeShared {
    state: Mutex<FacadeState>,
}

impl FacadeShared {
    fn active(&self) -> bool {
        !self.state.lock().unwrap().closed
    }
}

/// Connection-scoped API handed to [`WebSocketHandler`] callbacks.
pub struct WebSocketConnection {
    writer: ConnectionWriter,
    masking_key: Option<[u8; 4]>,
    request: Arc<HttpRequest>,
    remote_addr: SocketAddr,
    shared: Arc<FacadeShared>,
    executor: TaskExecutor,
    handle: Handle,
}

impl WebSocketConnection {
    pub(crate) fn new(
        writer: ConnectionWriter,
        masking_key: Option<[u8; 4]>,
        request: Arc<HttpRequest>,
        remote_addr: SocketAddr,
        executor: TaskExecutor,
        handle: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            writer,
            masking_key,
            request,
            remote_addr,
            shared: Arc::new(FacadeShared { state: Mutex::new(FacadeState { closed: false, disposables: Vec::new() }) }),
            executor,
            handle,
        })
    }

    /// The upgrade request this connection was established with.
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Sends a text message.
    pub fn send(&self, msg: &str) -> SendResult {
        self.send_frame(Opcode::Text, msg.as_bytes())
    }

    pub fn send_text(&self, data: &[u8]) -> SendResult {
        self.send_frame(Opcode::Text, data)
    }

    pub fn send_binary(&self, data: &[u8]) -> SendResult {
        self.send_frame(Opcode::Binary, data)
    }

    pub fn send_ping(&self, data: &[u8]) -> SendResult {
        self.send_frame(Opcode::Ping, data)
    }

    pub fn send_pong(&self, data: &[u8]) -> SendResult {
        self.send_frame(Opcode::Pong, data)
    }

    pub(crate) fn send_close(&self) -> SendResult {
        self.send_frame(Opcode::Close, &[])
    }

    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> SendResult {
        match encode_frame(opcode, payload, self.masking_key) {
            Ok(frame) => self.writer.send(frame),
            Err(cause) => {
                // invalid frame, e.g. an oversized control payload; nothing
                // was queued and the connection stays up
                SendResult::FailedOnError { cause: io::Error::new(io::ErrorKind::InvalidInput, cause.to_string()) }
            }
        }
    }

    /// Closes the connection: the writer shuts down and the read task is
    /// woken to run `on_close` and dispose session resources.
    pub fn close(&self) {
        self.writer.close();
    }

    pub fn is_closed(&self) -> bool {
        !self.shared.active()
    }

    /// Runs a task on the session's execution context, unless closed.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        let shared = self.shared.clone();
        self.executor.execute(move || {
            if shared.active() {
                task();
            }
        });
    }

    /// Runs a task once after `delay`. The returned handle cancels the
    /// timer; the task body is suppressed if the connection closed first.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Disposable {
        let shared = self.shared.clone();
        let executor = self.executor.clone();

        let timer = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !shared.active() {
                return;
            }
            let gate = shared.clone();
            executor.execute(move || {
                if gate.active() {
                    task();
                }
            });
        });

        Disposable::new(move || timer.abort())
    }

    /// Runs a task repeatedly on a fixed schedule. The handle is registered
    /// with the connection: it is disposed automatically on close, and
    /// disposing it cancels the timer and deregisters it.
    pub fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> Disposable {
        let shared = self.shared.clone();
        let executor = self.executor.clone();
        let task = Arc::new(task);

        let timer = self.handle.spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                if !shared.active() {
                    return;
                }
                submit_repeating(&executor, &shared, &task);
                interval.tick().await;
            }
        });

        self.register(Disposable::new(move || timer.abort()))
    }

    /// Like `schedule_at_fixed_rate`, but spacing restarts after each
    /// submission instead of following a fixed cadence.
    pub fn schedule_with_fixed_delay(
        &self,
        initial_delay: Duration,
        delay: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> Disposable {
        let shared = self.shared.clone();
        let executor = self.executor.clone();
        let task = Arc::new(task);

        let timer = self.handle.spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                if !shared.active() {
                    return;
                }
                submit_repeating(&executor, &shared, &task);
                tokio::time::sleep(delay).await;
            }
        });

        self.register(Disposable::new(move || timer.abort()))
    }

    /// Registers a disposable with the connection. If the connection already
    /// closed, it is disposed immediately.
    pub fn add(&self, disposable: Disposable) {
        let late = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                true
            } else {
                state.disposables.push(disposable.clone());
                false
            }
        };
        if late {
            disposable.dispose();
        }
    }

    /// Removes a previously added disposable without disposing it.
    pub fn remove(&self, disposable: &Disposable) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let before = state.disposables.len();
        state.disposables.retain(|other| !other.ptr_eq(disposable));
        state.disposables.len() < before
    }

    /// Number of registered disposables.
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().disposables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, underlying: Disposable) -> Disposable {
        self.add(underlying.clone());

        let shared = self.shared.clone();
        Disposable::new(move || {
            underlying.dispose();
            shared.state.lock().unwrap().disposables.retain(|other| !other.ptr_eq(&underlying));
        })
    }

    /// Marks the connection closed and disposes a snapshot of the registered
    /// disposables. Driven by the read task during teardown; idempotent.
    pub(crate) fn mark_closed(&self) {
        let snapshot = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.disposables)
        };
        for disposable in snapshot {
            disposable.dispose();
        }
    }
}

fn submit_repeating(executor: &TaskExecutor, shared: &Arc<FacadeShared>, task: &Arc<impl Fn() + Send + Sync + 'static>) {
    let task = task.clone();
    let gate = shared.clone();
    executor.execute(move || {
        if !gate.active() {
            return;
        }
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (*task)())).is_err() {
            error!("scheduled task panicked");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use http::Request;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::protocol::SizeClass;
    use crate::testing::CaptureStream;

    fn facade(stream: Arc<CaptureStream>) -> Arc<WebSocketConnection> {
        let writer = ConnectionWriter::new(stream, CancellationToken::new(), Handle::current());
        let request = Arc::new(HttpRequest::from(Request::builder().uri("/ws").body(Bytes::new()).unwrap()));
        WebSocketConnection::new(
            writer,
            None,
            request,
            "127.0.0.1:9000".parse().unwrap(),
            TaskExecutor::Runtime(Handle::current()),
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn send_encodes_text_frame() {
        let stream = CaptureStream::new();
        let conn = facade(stream.clone());

        assert!(conn.send("hello").is_success());
        assert_eq!(stream.written(), &[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[tokio::test]
    async fn send_close_emits_empty_close_frame() {
        let stream = CaptureStream::new();
        let conn = facade(stream.clone());

        conn.send_close();
        assert_eq!(stream.written(), &[0x88, 0x00]);
    }

    #[tokio::test]
    async fn large_binary_send_uses_large_size_class() {
        let stream = CaptureStream::new();
        let conn = facade(stream.clone());

        let payload = vec![0u8; 100_000];
        assert_eq!(SizeClass::find(payload.len()), SizeClass::Large);
        conn.send_binary(&payload);

        let written = stream.written();
        assert_eq!(written[0], 0x82);
        assert_eq!(written[1], 127);
        assert_eq!(written.len(), 2 + 8 + payload.len());
    }

    #[tokio::test]
    async fn oversized_control_send_is_refused_without_teardown() {
        let stream = CaptureStream::new();
        let conn = facade(stream.clone());

        let result = conn.send_ping(&[0x55; 200]);
        assert!(matches!(result, SendResult::FailedOnError { .. }));
        assert!(stream.written().is_empty());

        // the connection is still usable
        assert!(conn.send("still here").is_success());
    }

    #[tokio::test]
    async fn disposable_disposes_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let observed = count.clone();
        let disposable = Disposable::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        disposable.dispose();
        disposable.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(disposable.is_disposed());
    }

    #[tokio::test]
    async fn close_disposes_registered_snapshot() {
        let conn = facade(CaptureStream::new());
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let observed = count.clone();
            conn.add(Disposable::new(move || {
                observed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(conn.len(), 3);

        conn.mark_closed();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(conn.len(), 0);

        // second close is a no-op
        conn.mark_closed();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn add_after_close_disposes_immediately() {
        let conn = facade(CaptureStream::new());
        conn.mark_closed();

        let count = Arc::new(AtomicUsize::new(0));
        let observed = count.clone();
        conn.add(Disposable::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(conn.is_empty());
    }

    #[tokio::test]
    async fn remove_deregisters_without_disposing() {
        let conn = facade(CaptureStream::new());
        let disposable = Disposable::new(|| {});

        conn.add(disposable.clone());
        assert_eq!(conn.len(), 1);

        assert!(conn.remove(&disposable));
        assert!(!conn.remove(&disposable));
        assert!(!disposable.is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_task_suppressed_after_close() {
        let conn = facade(CaptureStream::new());
        let count = Arc::new(AtomicUsize::new(0));

        let observed = count.clone();
        conn.schedule(Duration::from_secs(5), move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        conn.mark_closed();
        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_rate_schedule_fires_until_disposed() {
        let conn = facade(CaptureStream::new());
        let count = Arc::new(AtomicUsize::new(0));

        let observed = count.clone();
        let handle =
            conn.schedule_at_fixed_rate(Duration::from_secs(1), Duration::from_secs(1), move || {
                observed.fetch_add(1, Ordering::SeqCst);
            });
        assert_eq!(conn.len(), 1);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 2, "expected repeated firings, saw {fired}");

        handle.dispose();
        assert_eq!(conn.len(), 0);

        let before = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), before);
    }
}
