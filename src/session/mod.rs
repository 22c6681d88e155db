//! Per-session dispatch policy.
//!
//! A session is one accepted connection. The dispatcher decides where its
//! handler callbacks run: synchronously on the connection's read task, or on
//! a dedicated sequential fiber so user code can block without stalling I/O.

mod fiber;

pub use fiber::Fiber;

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::error;

use crate::connection::ConnectionWriter;
use crate::handler::{HttpHandler, ResponseWriter};
use crate::protocol::HttpRequest;
use crate::ws::{FiberEndpoint, InlineEndpoint, WebSocketConnection, WebSocketHandler, WsEndpoint};

/// Creates the per-connection session state `S` when a connection is
/// accepted.
///
/// Implemented for free by any `Fn(SocketAddr) -> S` closure.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send + Sync + 'static;

    fn create(&self, remote_addr: SocketAddr) -> Self::Session;
}

impl<S, F> SessionFactory for F
where
    F: Fn(SocketAddr) -> S + Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    type Session = S;

    fn create(&self, remote_addr: SocketAddr) -> S {
        self(remote_addr)
    }
}

/// Configuration-time choice of dispatch policy, applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherFactory {
    /// Callbacks run on the connection's read task. Zero handoff latency;
    /// handlers must not block.
    OnReadThread,
    /// Each session gets its own fiber. The flags select which callback
    /// kinds are routed through it.
    Fiber { use_for_http: bool, use_for_websocket: bool },
}

impl DispatcherFactory {
    pub(crate) fn create_for_session(&self) -> SessionDispatcher {
        match *self {
            DispatcherFactory::OnReadThread => SessionDispatcher::OnReadThread,
            DispatcherFactory::Fiber { use_for_http, use_for_websocket } => SessionDispatcher::Fiber {
                fiber: Fiber::spawn(),
                use_for_http,
                use_for_websocket,
                is_websocket: false,
            },
        }
    }
}

/// Per-session dispatcher instance, owned by the connection.
pub(crate) enum SessionDispatcher {
    OnReadThread,
    Fiber { fiber: Arc<Fiber>, use_for_http: bool, use_for_websocket: bool, is_websocket: bool },
}

impl SessionDispatcher {
    /// Routes one HTTP request to its handler. `close_after` closes the
    /// connection once the handler's response has drained.
    pub(crate) fn dispatch_http<S: Send + Sync + 'static>(
        &self,
        handler: Arc<dyn HttpHandler<S>>,
        request: HttpRequest,
        response: ResponseWriter,
        session: Arc<S>,
        close_after: bool,
    ) {
        match self {
            SessionDispatcher::Fiber { fiber, use_for_http: true, .. } => {
                fiber.execute(move || run_http(handler.as_ref(), &request, &response, &session, close_after));
            }
            _ => run_http(handler.as_ref(), &request, &response, &session, close_after),
        }
    }

    /// Builds the connection facade and frame-delivery endpoint for an
    /// accepted upgrade, applying this session's dispatch policy.
    pub(crate) fn accept_websocket<S, H>(
        &mut self,
        handler: Arc<H>,
        writer: ConnectionWriter,
        request: Arc<HttpRequest>,
        remote_addr: SocketAddr,
        session: Arc<S>,
    ) -> (Arc<WebSocketConnection>, Box<dyn WsEndpoint>)
    where
        S: Send + Sync + 'static,
        H: WebSocketHandler<S>,
    {
        let handle = Handle::current();

        match self {
            SessionDispatcher::Fiber { fiber, use_for_websocket: true, is_websocket, .. } => {
                *is_websocket = true;
                let conn = WebSocketConnection::new(
                    writer,
                    None,
                    request,
                    remote_addr,
                    TaskExecutor::Fiber(fiber.clone()),
                    handle,
                );
                let endpoint = FiberEndpoint::new(fiber.clone(), handler, conn.clone(), session);
                (conn, Box::new(endpoint))
            }
            _ => {
                let conn = WebSocketConnection::new(
                    writer,
                    None,
                    request,
                    remote_addr,
                    TaskExecutor::Runtime(handle.clone()),
                    handle,
                );
                let endpoint = InlineEndpoint::new(handler, conn.clone(), session);
                (conn, Box::new(endpoint))
            }
        }
    }

    /// Session teardown. WebSocket sessions shut their fiber down from
    /// `on_close`; everything else is released here.
    pub(crate) fn on_session_close(&self) {
        if let SessionDispatcher::Fiber { fiber, is_websocket, .. } = self {
            if !is_websocket {
                fiber.shutdown();
            }
        }
    }
}

fn run_http<S: 'static>(
    handler: &dyn HttpHandler<S>,
    request: &HttpRequest,
    response: &ResponseWriter,
    session: &Arc<S>,
    close_after: bool,
) {
    let _ = run_user("handle", || handler.handle(request, response, session));
    if close_after {
        response.close_when_drained();
    }
}

/// Where facade `execute`/scheduled bodies run: the runtime at large for
/// read-thread sessions, the session fiber otherwise.
#[derive(Clone)]
pub(crate) enum TaskExecutor {
    Runtime(Handle),
    Fiber(Arc<Fiber>),
}

impl TaskExecutor {
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        match self {
            TaskExecutor::Runtime(handle) => {
                handle.spawn(async move { job() });
            }
            TaskExecutor::Fiber(fiber) => fiber.execute(job),
        }
    }
}

/// Runs user code at a dispatch boundary. Panics are caught and reported;
/// they never unwind into the read task or a fiber worker.
pub(crate) fn run_user(label: &str, f: impl FnOnce()) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => Ok(()),
        Err(panic) => {
            let message = panic_message(panic);
            error!(callback = label, panic = %message, "handler panicked");
            Err(message)
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
