use std::sync::Arc;

use http::StatusCode;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use weft::handler::ResponseWriter;
use weft::protocol::HttpRequest;
use weft::server::Server;
use weft::ws::{WebSocketConnection, WebSocketHandler};

/// Echoes every text and binary message back to the peer.
struct EchoHandler;

impl WebSocketHandler<()> for EchoHandler {
    type State = u64;

    fn on_open(&self, _conn: &Arc<WebSocketConnection>, _request: &HttpRequest, _session: &Arc<()>) -> u64 {
        0
    }

    fn on_message(&self, conn: &Arc<WebSocketConnection>, echoed: &mut u64, message: String) {
        *echoed += 1;
        conn.send(&message);
    }

    fn on_binary(&self, conn: &Arc<WebSocketConnection>, echoed: &mut u64, data: Vec<u8>) {
        *echoed += 1;
        conn.send_binary(&data);
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    Server::builder(|_addr| ())
        .route("/hello", |_request: &HttpRequest, response: &ResponseWriter, _session: &Arc<()>| {
            response.send_response(StatusCode::OK, "text/plain", "hello from weft");
        })
        .websocket("/echo", EchoHandler)
        .build()
        .start("127.0.0.1:8080")
        .await
}
