use std::collections::HashMap;
use std::sync::Arc;

use http::StatusCode;
use tracing::{debug, warn};

use crate::codec::{upgrade_response, validate_upgrade};
use crate::handler::{HttpHandler, NextAction, RequestContext, RequestHandler, WsSecurity};
use crate::protocol::HttpRequest;
use crate::ws::WebSocketHandler;

/// One registered path. WebSocket routes are type-erased behind the upgrade
/// step so the handler's per-socket state type stays internal.
pub(crate) enum Route<S> {
    Http(Arc<dyn HttpHandler<S>>),
    WebSocket(Arc<dyn WsUpgradeRoute<S>>),
}

/// Exact-match request router; the default [`RequestHandler`].
///
/// The route table is built at startup and read-only afterwards. Unmatched
/// paths fall through to the default handler.
pub struct Router<S> {
    routes: HashMap<String, Route<S>>,
    default_handler: Arc<dyn HttpHandler<S>>,
}

impl<S: Send + Sync + 'static> Router<S> {
    pub(crate) fn new(routes: HashMap<String, Route<S>>, default_handler: Arc<dyn HttpHandler<S>>) -> Self {
        Self { routes, default_handler }
    }

    fn dispatch(
        &self,
        handler: Arc<dyn HttpHandler<S>>,
        request: HttpRequest,
        ctx: &mut RequestContext<'_, S>,
    ) -> NextAction {
        let close_after = request.close_after_response();
        let response = ctx.response_for(&request);
        ctx.dispatcher.dispatch_http(handler, request, response, ctx.session.clone(), close_after);
        if close_after {
            NextAction::Close
        } else {
            NextAction::Continue
        }
    }
}

impl<S: Send + Sync + 'static> RequestHandler<S> for Router<S> {
    fn on_request(&self, request: HttpRequest, ctx: &mut RequestContext<'_, S>) -> NextAction {
        match self.routes.get(request.path()) {
            Some(Route::WebSocket(route)) => route.upgrade(request, ctx),
            Some(Route::Http(handler)) => self.dispatch(handler.clone(), request, ctx),
            None => {
                debug!(path = request.path(), "no route matched, using default handler");
                self.dispatch(self.default_handler.clone(), request, ctx)
            }
        }
    }
}

/// The handshake + endpoint construction step for one WebSocket route.
pub(crate) trait WsUpgradeRoute<S>: Send + Sync {
    fn upgrade(&self, request: HttpRequest, ctx: &mut RequestContext<'_, S>) -> NextAction;
}

pub(crate) struct WsRouteEntry<H, Sec> {
    handler: Arc<H>,
    security: Sec,
}

impl<H, Sec> WsRouteEntry<H, Sec> {
    pub(crate) fn new(handler: Arc<H>, security: Sec) -> Self {
        Self { handler, security }
    }
}

impl<S, H, Sec> WsUpgradeRoute<S> for WsRouteEntry<H, Sec>
where
    S: Send + Sync + 'static,
    H: WebSocketHandler<S>,
    Sec: WsSecurity<S>,
{
    fn upgrade(&self, request: HttpRequest, ctx: &mut RequestContext<'_, S>) -> NextAction {
        if !self.security.authorize(&request, ctx.session) {
            warn!(path = request.path(), "websocket upgrade refused by security policy");
            ctx.response().send_response(StatusCode::UNAUTHORIZED, "text/plain", "Unauthorized");
            return NextAction::Continue;
        }

        let key = match validate_upgrade(&request) {
            Ok(key) => key.to_string(),
            Err(cause) => {
                warn!(%cause, path = request.path(), "invalid websocket handshake");
                ctx.response().send_response(StatusCode::BAD_REQUEST, "text/plain", "Bad Request");
                return NextAction::Continue;
            }
        };

        ctx.writer.send(upgrade_response(&key));

        let request = Arc::new(request);
        let (conn, mut endpoint) = ctx.dispatcher.accept_websocket(
            self.handler.clone(),
            ctx.writer.clone(),
            request,
            ctx.remote_addr,
            ctx.session.clone(),
        );
        endpoint.on_open();

        NextAction::Upgrade { conn, endpoint }
    }
}
