//! Server configuration and accept loop.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionWriter};
use crate::handler::{
    HttpHandler, IdentityDecorator, NoSecurity, NotFoundHandler, RequestDecorator, RequestHandler, Route, Router,
    WsRouteEntry, WsSecurity,
};
use crate::session::{DispatcherFactory, SessionFactory};
use crate::ws::WebSocketHandler;

/// How inbound text frame payloads become `String`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextDecoding {
    /// Invalid UTF-8 is a protocol error and closes the connection.
    Strict,
    /// Invalid sequences become replacement characters.
    Lossy,
}

/// Connection-level knobs, shared by every accepted connection.
#[derive(Clone, Copy)]
pub(crate) struct ServerConfig {
    /// Initial read buffer capacity per connection.
    pub(crate) read_buffer_size: usize,
    /// Events decoded per read wakeup before yielding to other connections.
    pub(crate) max_read_loops: usize,
    pub(crate) text_decoding: TextDecoding,
    pub(crate) dispatcher: DispatcherFactory,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            max_read_loops: 50,
            text_decoding: TextDecoding::Strict,
            dispatcher: DispatcherFactory::OnReadThread,
        }
    }
}

/// Builder wiring routes, the default handler, the decorator, and the
/// dispatch policy into a [`Server`].
pub struct ServerBuilder<F: SessionFactory> {
    factory: F,
    routes: HashMap<String, Route<F::Session>>,
    default_handler: Arc<dyn HttpHandler<F::Session>>,
    decorator: Box<dyn RequestDecorator<F::Session>>,
    config: ServerConfig,
}

impl<F: SessionFactory> ServerBuilder<F> {
    fn new(factory: F) -> Self {
        Self {
            factory,
            routes: HashMap::new(),
            default_handler: Arc::new(NotFoundHandler),
            decorator: Box::new(IdentityDecorator),
            config: ServerConfig::default(),
        }
    }

    /// Registers an HTTP handler under an exact path.
    pub fn route(mut self, path: impl Into<String>, handler: impl HttpHandler<F::Session>) -> Self {
        self.routes.insert(path.into(), Route::Http(Arc::new(handler)));
        self
    }

    /// Registers a WebSocket handler under an exact path.
    pub fn websocket(self, path: impl Into<String>, handler: impl WebSocketHandler<F::Session>) -> Self {
        self.websocket_secured(path, handler, NoSecurity)
    }

    /// Registers a WebSocket handler guarded by a security policy; refused
    /// upgrades get `401 Unauthorized`.
    pub fn websocket_secured(
        mut self,
        path: impl Into<String>,
        handler: impl WebSocketHandler<F::Session>,
        security: impl WsSecurity<F::Session>,
    ) -> Self {
        self.routes
            .insert(path.into(), Route::WebSocket(Arc::new(WsRouteEntry::new(Arc::new(handler), security))));
        self
    }

    /// Replaces the fallback for unmatched paths (default: 404).
    pub fn default_handler(mut self, handler: impl HttpHandler<F::Session>) -> Self {
        self.default_handler = Arc::new(handler);
        self
    }

    /// Wraps the request handler chain, e.g. for authentication.
    pub fn decorator(mut self, decorator: impl RequestDecorator<F::Session>) -> Self {
        self.decorator = Box::new(decorator);
        self
    }

    /// Initial per-connection read buffer capacity (default 1024).
    pub fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.config.read_buffer_size = bytes;
        self
    }

    /// Events decoded per read wakeup before yielding (default 50).
    pub fn max_read_loops(mut self, loops: usize) -> Self {
        self.config.max_read_loops = loops;
        self
    }

    /// Text frame decoding mode (default strict).
    pub fn text_decoding(mut self, mode: TextDecoding) -> Self {
        self.config.text_decoding = mode;
        self
    }

    /// Dispatch policy for handler callbacks (default on read thread).
    pub fn dispatcher(mut self, dispatcher: DispatcherFactory) -> Self {
        self.config.dispatcher = dispatcher;
        self
    }

    pub fn build(self) -> Server<F> {
        let router = Router::new(self.routes, self.default_handler);
        let handler = self.decorator.decorate(Arc::new(router));
        Server { inner: Arc::new(ServerInner { factory: self.factory, handler, config: self.config }) }
    }
}

struct ServerInner<F: SessionFactory> {
    factory: F,
    handler: Arc<dyn RequestHandler<F::Session>>,
    config: ServerConfig,
}

/// The server: accepts connections and spawns one read task per connection.
pub struct Server<F: SessionFactory> {
    inner: Arc<ServerInner<F>>,
}

impl<F: SessionFactory> Server<F> {
    pub fn builder(factory: F) -> ServerBuilder<F> {
        ServerBuilder::new(factory)
    }

    /// Binds and runs the accept loop.
    pub async fn start<A: ToSocketAddrs>(self, addr: A) -> io::Result<()> {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(cause) => {
                error!(%cause, "bind server error");
                return Err(cause);
            }
        };
        self.serve(listener).await
    }

    /// Runs the accept loop on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        if let Ok(local_addr) = listener.local_addr() {
            info!(%local_addr, "server listening");
        }

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(stream_and_addr) => stream_and_addr,
                Err(cause) => {
                    warn!(%cause, "failed to accept");
                    continue;
                }
            };

            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let session = Arc::new(inner.factory.create(remote_addr));
                let dispatcher = inner.config.dispatcher.create_for_session();

                let (read_half, write_half) = stream.into_split();
                let shutdown = CancellationToken::new();
                let writer = ConnectionWriter::new(Arc::new(write_half), shutdown.clone(), Handle::current());

                let connection = Connection::new(
                    read_half,
                    writer,
                    shutdown,
                    session,
                    dispatcher,
                    inner.handler.clone(),
                    remote_addr,
                    &inner.config,
                );
                connection.process().await;
                debug!(%remote_addr, "connection finished");
            });
        }
    }
}
