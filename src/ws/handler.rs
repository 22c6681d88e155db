use std::sync::{Arc, Mutex};

use tracing::error;

use crate::protocol::HttpRequest;
use crate::session::{run_user, Fiber};
use crate::ws::WebSocketConnection;

/// Callbacks for one WebSocket route.
///
/// `State` is per-socket state returned by `on_open`; every later callback
/// for the same socket receives it mutably. Callbacks for one session are
/// never invoked concurrently, and arrive in byte-arrival order.
///
/// With the on-read-thread dispatcher, callbacks run on the connection's
/// read task and must not block.
pub trait WebSocketHandler<S>: Send + Sync + 'static {
    type State: Send + 'static;

    fn on_open(&self, conn: &Arc<WebSocketConnection>, request: &HttpRequest, session: &Arc<S>) -> Self::State;

    fn on_message(&self, conn: &Arc<WebSocketConnection>, state: &mut Self::State, message: String) {
        let _ = (conn, state, message);
    }

    fn on_binary(&self, conn: &Arc<WebSocketConnection>, state: &mut Self::State, data: Vec<u8>) {
        let _ = (conn, state, data);
    }

    fn on_ping(&self, conn: &Arc<WebSocketConnection>, state: &mut Self::State, data: Vec<u8>) {
        let _ = (conn, state, data);
    }

    fn on_pong(&self, conn: &Arc<WebSocketConnection>, state: &mut Self::State, data: Vec<u8>) {
        let _ = (conn, state, data);
    }

    fn on_close(&self, conn: &Arc<WebSocketConnection>, state: &mut Self::State) {
        let _ = (conn, state);
    }

    /// Protocol violations, write failures, and caught handler panics all
    /// arrive here. `state` is absent when the failure predates `on_open`.
    fn on_error(&self, conn: &Arc<WebSocketConnection>, state: Option<&mut Self::State>, error: &str) {
        let _ = (conn, state);
        error!(error, "websocket session error");
    }
}

/// Type-erased delivery target for decoded frames.
///
/// The read task talks to one of these after the upgrade; the concrete type
/// applies the session's dispatch policy. Constructed by the router during
/// an upgrade; handler authors never implement it.
pub trait WsEndpoint: Send {
    fn on_open(&mut self);
    fn on_message(&mut self, message: String);
    fn on_binary(&mut self, data: Vec<u8>);
    fn on_ping(&mut self, data: Vec<u8>);
    fn on_pong(&mut self, data: Vec<u8>);
    fn on_close(&mut self);
    fn on_error(&mut self, error: String);
}

/// Runs callbacks synchronously on the read task.
pub(crate) struct InlineEndpoint<S, H: WebSocketHandler<S>> {
    handler: Arc<H>,
    conn: Arc<WebSocketConnection>,
    session: Arc<S>,
    state: Option<H::State>,
}

impl<S, H: WebSocketHandler<S>> InlineEndpoint<S, H> {
    pub(crate) fn new(handler: Arc<H>, conn: Arc<WebSocketConnection>, session: Arc<S>) -> Self {
        Self { handler, conn, session, state: None }
    }

    fn dispatch(&mut self, label: &str, callback: impl FnOnce(&H, &Arc<WebSocketConnection>, &mut H::State)) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let handler = &self.handler;
        let conn = &self.conn;
        if let Err(panic) = run_user(label, || callback(handler, conn, state)) {
            report_error(handler.as_ref(), conn, self.state.as_mut(), &panic);
        }
    }
}

impl<S, H: WebSocketHandler<S>> WsEndpoint for InlineEndpoint<S, H>
where
    S: Send + Sync + 'static,
{
    fn on_open(&mut self) {
        let handler = &self.handler;
        let conn = &self.conn;
        let session = &self.session;
        let request = conn.request();

        let mut opened = None;
        if let Err(panic) = run_user("on_open", || opened = Some(handler.on_open(conn, request, session))) {
            report_error(handler.as_ref(), conn, None, &panic);
        }
        self.state = opened;
    }

    fn on_message(&mut self, message: String) {
        self.dispatch("on_message", move |handler, conn, state| handler.on_message(conn, state, message));
    }

    fn on_binary(&mut self, data: Vec<u8>) {
        self.dispatch("on_binary", move |handler, conn, state| handler.on_binary(conn, state, data));
    }

    fn on_ping(&mut self, data: Vec<u8>) {
        self.dispatch("on_ping", move |handler, conn, state| handler.on_ping(conn, state, data));
    }

    fn on_pong(&mut self, data: Vec<u8>) {
        self.dispatch("on_pong", move |handler, conn, state| handler.on_pong(conn, state, data));
    }

    fn on_close(&mut self) {
        self.dispatch("on_close", |handler, conn, state| handler.on_close(conn, state));
    }

    fn on_error(&mut self, error: String) {
        let handler = &self.handler;
        let conn = &self.conn;
        report_error(handler.as_ref(), conn, self.state.as_mut(), &error);
    }
}

/// Queues every callback onto the session's fiber; user code never runs on
/// the read task.
pub(crate) struct FiberEndpoint<S, H: WebSocketHandler<S>> {
    fiber: Arc<Fiber>,
    handler: Arc<H>,
    conn: Arc<WebSocketConnection>,
    session: Arc<S>,
    state: Arc<Mutex<Option<H::State>>>,
}

impl<S, H: WebSocketHandler<S>> FiberEndpoint<S, H>
where
    S: Send + Sync + 'static,
{
    pub(crate) fn new(fiber: Arc<Fiber>, handler: Arc<H>, conn: Arc<WebSocketConnection>, session: Arc<S>) -> Self {
        Self { fiber, handler, conn, session, state: Arc::new(Mutex::new(None)) }
    }

    fn submit(
        &self,
        label: &'static str,
        callback: impl FnOnce(&H, &Arc<WebSocketConnection>, &mut H::State) + Send + 'static,
    ) {
        let handler = self.handler.clone();
        let conn = self.conn.clone();
        let state = self.state.clone();

        self.fiber.execute(move || {
            let mut guard = state.lock().unwrap();
            let Some(current) = guard.as_mut() else {
                return;
            };
            if let Err(panic) = run_user(label, || callback(&handler, &conn, &mut *current)) {
                report_error(handler.as_ref(), &conn, Some(current), &panic);
            }
        });
    }
}

impl<S, H: WebSocketHandler<S>> WsEndpoint for FiberEndpoint<S, H>
where
    S: Send + Sync + 'static,
{
    fn on_open(&mut self) {
        let handler = self.handler.clone();
        let conn = self.conn.clone();
        let session = self.session.clone();
        let state = self.state.clone();

        self.fiber.execute(move || {
            let mut opened = None;
            if let Err(panic) = run_user("on_open", || opened = Some(handler.on_open(&conn, conn.request(), &session))) {
                report_error(handler.as_ref(), &conn, None, &panic);
            }
            *state.lock().unwrap() = opened;
        });
    }

    fn on_message(&mut self, message: String) {
        self.submit("on_message", move |handler, conn, state| handler.on_message(conn, state, message));
    }

    fn on_binary(&mut self, data: Vec<u8>) {
        self.submit("on_binary", move |handler, conn, state| handler.on_binary(conn, state, data));
    }

    fn on_ping(&mut self, data: Vec<u8>) {
        self.submit("on_ping", move |handler, conn, state| handler.on_ping(conn, state, data));
    }

    fn on_pong(&mut self, data: Vec<u8>) {
        self.submit("on_pong", move |handler, conn, state| handler.on_pong(conn, state, data));
    }

    fn on_close(&mut self) {
        self.submit("on_close", |handler, conn, state| handler.on_close(conn, state));
        // everything queued ahead of on_close still runs; nothing after may
        self.fiber.shutdown();
    }

    fn on_error(&mut self, error: String) {
        let handler = self.handler.clone();
        let conn = self.conn.clone();
        let state = self.state.clone();

        self.fiber.execute(move || {
            let mut state = state.lock().unwrap();
            report_error(handler.as_ref(), &conn, state.as_mut(), &error);
        });
    }
}

/// `on_error` is itself user code; a panic inside it is contained here.
fn report_error<S, H: WebSocketHandler<S>>(
    handler: &H,
    conn: &Arc<WebSocketConnection>,
    state: Option<&mut H::State>,
    error: &str,
) {
    let _ = run_user("on_error", || handler.on_error(conn, state, error));
}
