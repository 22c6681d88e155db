//! Handler contracts and request routing.

mod response;
mod router;

pub use response::ResponseWriter;
pub use router::Router;
pub(crate) use router::{Route, WsRouteEntry};

use std::net::SocketAddr;
use std::sync::Arc;

use http::StatusCode;

use crate::connection::ConnectionWriter;
use crate::protocol::HttpRequest;
use crate::session::SessionDispatcher;
use crate::ws::{WebSocketConnection, WsEndpoint};

/// Application callback for one HTTP route.
///
/// Runs on the connection's read task or the session fiber depending on the
/// configured dispatcher; with the on-read-thread dispatcher it must not
/// block. Implemented for free by any matching closure.
pub trait HttpHandler<S>: Send + Sync + 'static {
    fn handle(&self, request: &HttpRequest, response: &ResponseWriter, session: &Arc<S>);
}

impl<S, F> HttpHandler<S> for F
where
    F: Fn(&HttpRequest, &ResponseWriter, &Arc<S>) + Send + Sync + 'static,
{
    fn handle(&self, request: &HttpRequest, response: &ResponseWriter, session: &Arc<S>) {
        self(request, response, session)
    }
}

/// The configured fallback for unmatched paths: `404 Not Found` with the
/// request URI echoed in plain text.
pub struct NotFoundHandler;

impl<S: Send + Sync + 'static> HttpHandler<S> for NotFoundHandler {
    fn handle(&self, request: &HttpRequest, response: &ResponseWriter, _session: &Arc<S>) {
        response.send_response(StatusCode::NOT_FOUND, "text/plain", format!("{} Not Found", request.uri()));
    }
}

/// Authorizes a WebSocket upgrade before the handshake is accepted.
///
/// Implemented for free by any `Fn(&HttpRequest, &Arc<S>) -> bool` closure.
pub trait WsSecurity<S>: Send + Sync + 'static {
    fn authorize(&self, request: &HttpRequest, session: &Arc<S>) -> bool;
}

/// Permits every upgrade.
pub struct NoSecurity;

impl<S: Send + Sync + 'static> WsSecurity<S> for NoSecurity {
    fn authorize(&self, _request: &HttpRequest, _session: &Arc<S>) -> bool {
        true
    }
}

impl<S, F> WsSecurity<S> for F
where
    F: Fn(&HttpRequest, &Arc<S>) -> bool + Send + Sync + 'static,
{
    fn authorize(&self, request: &HttpRequest, session: &Arc<S>) -> bool {
        self(request, session)
    }
}

/// What the connection does after a request has been handled.
pub enum NextAction {
    /// Keep parsing requests on this connection.
    Continue,
    /// Stop parsing; the connection closes once the response drains.
    Close,
    /// The connection switched protocols; subsequent bytes are frames.
    Upgrade { conn: Arc<WebSocketConnection>, endpoint: Box<dyn WsEndpoint> },
}

/// Per-request context handed to the request handler chain.
pub struct RequestContext<'a, S> {
    pub(crate) writer: &'a ConnectionWriter,
    pub(crate) dispatcher: &'a mut SessionDispatcher,
    pub(crate) session: &'a Arc<S>,
    pub(crate) remote_addr: SocketAddr,
}

impl<'a, S> RequestContext<'a, S> {
    /// A response writer for this connection, keeping the connection open.
    pub fn response(&self) -> ResponseWriter {
        ResponseWriter::new(self.writer.clone(), false)
    }

    /// A response writer for the given request, echoing `Connection: close`
    /// when the request asked for teardown.
    pub fn response_for(&self, request: &HttpRequest) -> ResponseWriter {
        ResponseWriter::new(self.writer.clone(), request.close_after_response())
    }

    pub fn session(&self) -> &Arc<S> {
        self.session
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// The full request-handling step: routing plus dispatch. The router is the
/// default implementation; decorators wrap it.
pub trait RequestHandler<S>: Send + Sync + 'static {
    fn on_request(&self, request: HttpRequest, ctx: &mut RequestContext<'_, S>) -> NextAction;
}

/// Wraps the request handler chain, e.g. for authentication. A decorator may
/// short-circuit by responding itself and returning without calling the
/// inner handler.
pub trait RequestDecorator<S>: Send + Sync + 'static {
    fn decorate(&self, inner: Arc<dyn RequestHandler<S>>) -> Arc<dyn RequestHandler<S>>;
}

/// The default decorator: leaves the handler chain untouched.
pub struct IdentityDecorator;

impl<S: Send + Sync + 'static> RequestDecorator<S> for IdentityDecorator {
    fn decorate(&self, inner: Arc<dyn RequestHandler<S>>) -> Arc<dyn RequestHandler<S>> {
        inner
    }
}
