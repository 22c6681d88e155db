//! Per-connection read driver.
//!
//! Each accepted connection is served by one task that owns the read half,
//! the read buffer, and the read state machine. The task reads, decodes at
//! most `max_read_loops` events per wakeup, routes HTTP requests, applies
//! the WebSocket delivery rules, and runs teardown exactly once.

mod writer;

pub use writer::{ConnectionWriter, SendResult, SendStream};

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{ConnEvent, ConnectionDecoder};
use crate::handler::{NextAction, RequestContext, RequestHandler};
use crate::protocol::{Frame, Opcode, ParseError};
use crate::server::{ServerConfig, TextDecoding};
use crate::session::SessionDispatcher;
use crate::ws::{WebSocketConnection, WsEndpoint};

/// WebSocket delivery state, present after a successful upgrade.
struct WsRuntime {
    conn: Arc<WebSocketConnection>,
    endpoint: Box<dyn WsEndpoint>,
    /// Defragmentation buffer for continuation sequences.
    frag_opcode: Option<Opcode>,
    frag_buf: BytesMut,
}

pub(crate) struct Connection<R, S> {
    reader: R,
    buffer: BytesMut,
    decoder: ConnectionDecoder,
    writer: ConnectionWriter,
    shutdown: CancellationToken,
    session: Arc<S>,
    dispatcher: SessionDispatcher,
    handler: Arc<dyn RequestHandler<S>>,
    remote_addr: SocketAddr,
    max_read_loops: usize,
    text_decoding: TextDecoding,
    ws: Option<WsRuntime>,
}

enum Outcome {
    KeepReading,
    TearDown,
}

impl<R, S> Connection<R, S>
where
    R: AsyncRead + Unpin,
    S: Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        reader: R,
        writer: ConnectionWriter,
        shutdown: CancellationToken,
        session: Arc<S>,
        dispatcher: SessionDispatcher,
        handler: Arc<dyn RequestHandler<S>>,
        remote_addr: SocketAddr,
        config: &ServerConfig,
    ) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(config.read_buffer_size),
            decoder: ConnectionDecoder::new(),
            writer,
            shutdown,
            session,
            dispatcher,
            handler,
            remote_addr,
            max_read_loops: config.max_read_loops,
            text_decoding: config.text_decoding,
            ws: None,
        }
    }

    /// Runs the connection to completion. Teardown always executes, whether
    /// the peer closed, a protocol error occurred, or the writer cancelled.
    pub(crate) async fn process(mut self) {
        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = self.reader.read_buf(&mut self.buffer) => read,
            };

            match read {
                Ok(0) => {
                    debug!("peer closed the connection");
                    break;
                }
                Ok(_) => {
                    if matches!(self.drain_events().await, Outcome::TearDown) {
                        break;
                    }
                }
                Err(cause) => {
                    warn!(%cause, "read failed");
                    break;
                }
            }
        }

        self.teardown();
    }

    /// Decodes buffered bytes into events, at most `max_read_loops` per
    /// pass; a loaded buffer yields to other tasks between passes so one hot
    /// connection cannot starve the rest.
    async fn drain_events(&mut self) -> Outcome {
        loop {
            let mut processed = 0;
            while processed < self.max_read_loops {
                match self.decoder.decode(&mut self.buffer) {
                    Ok(Some(event)) => {
                        processed += 1;
                        if matches!(self.on_event(event), Outcome::TearDown) {
                            return Outcome::TearDown;
                        }
                    }
                    Ok(None) => return Outcome::KeepReading,
                    Err(cause) => {
                        self.on_protocol_error(&cause);
                        return Outcome::TearDown;
                    }
                }
            }
            tokio::task::yield_now().await;
        }
    }

    fn on_event(&mut self, event: ConnEvent) -> Outcome {
        match event {
            ConnEvent::Request(request) => {
                let mut ctx = RequestContext {
                    writer: &self.writer,
                    dispatcher: &mut self.dispatcher,
                    session: &self.session,
                    remote_addr: self.remote_addr,
                };

                match self.handler.on_request(request, &mut ctx) {
                    NextAction::Continue => Outcome::KeepReading,
                    NextAction::Close => {
                        // the dispatch path closes the writer once the
                        // response drains; just stop parsing
                        self.decoder.close();
                        Outcome::KeepReading
                    }
                    NextAction::Upgrade { conn, endpoint } => {
                        self.decoder.upgrade();
                        self.ws = Some(WsRuntime { conn, endpoint, frag_opcode: None, frag_buf: BytesMut::new() });
                        Outcome::KeepReading
                    }
                }
            }
            ConnEvent::Frame(frame) => self.on_frame(frame),
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Outcome {
        let Some(ws) = self.ws.as_mut() else {
            // the decoder only yields frames after an upgrade
            warn!("frame received without websocket runtime");
            return Outcome::TearDown;
        };

        match frame.header.opcode {
            Opcode::Text | Opcode::Binary if !frame.header.fin => {
                ws.frag_opcode = Some(frame.header.opcode);
                ws.frag_buf.clear();
                ws.frag_buf.extend_from_slice(&frame.payload);
                Outcome::KeepReading
            }

            Opcode::Text => self.deliver_message(Opcode::Text, frame.payload.to_vec()),
            Opcode::Binary => self.deliver_message(Opcode::Binary, frame.payload.to_vec()),

            Opcode::Continuation => {
                if ws.frag_opcode.is_none() {
                    self.on_protocol_error(&ParseError::invalid_frame("continuation without initial frame"));
                    return Outcome::TearDown;
                }
                ws.frag_buf.extend_from_slice(&frame.payload);
                let frag_len = ws.frag_buf.len() as u64;
                if frag_len > crate::codec::MAX_PAYLOAD_BYTES {
                    self.on_protocol_error(&ParseError::too_large_payload(
                        frag_len,
                        crate::codec::MAX_PAYLOAD_BYTES,
                    ));
                    return Outcome::TearDown;
                }
                if !frame.header.fin {
                    return Outcome::KeepReading;
                }
                let opcode = ws.frag_opcode.take().expect("fragmentation in progress");
                let payload = ws.frag_buf.split().to_vec();
                self.deliver_message(opcode, payload)
            }

            Opcode::Ping => {
                // the pong goes out before the handler sees the ping
                ws.conn.send_pong(&frame.payload);
                ws.endpoint.on_ping(frame.payload.to_vec());
                Outcome::KeepReading
            }

            Opcode::Pong => {
                ws.endpoint.on_pong(frame.payload.to_vec());
                Outcome::KeepReading
            }

            Opcode::Close => {
                debug!("close frame received");
                ws.conn.send_close();
                Outcome::TearDown
            }
        }
    }

    fn deliver_message(&mut self, opcode: Opcode, payload: Vec<u8>) -> Outcome {
        if opcode != Opcode::Text {
            self.ws.as_mut().expect("checked by caller").endpoint.on_binary(payload);
            return Outcome::KeepReading;
        }

        let message = match self.text_decoding {
            TextDecoding::Strict => match String::from_utf8(payload) {
                Ok(message) => message,
                Err(_) => {
                    self.on_protocol_error(&ParseError::InvalidUtf8);
                    return Outcome::TearDown;
                }
            },
            TextDecoding::Lossy => String::from_utf8_lossy(&payload).into_owned(),
        };
        self.ws.as_mut().expect("checked by caller").endpoint.on_message(message);
        Outcome::KeepReading
    }

    fn on_protocol_error(&mut self, cause: &ParseError) {
        warn!(%cause, "protocol error, closing connection");
        if let Some(ws) = self.ws.as_mut() {
            ws.endpoint.on_error(cause.to_string());
        }
    }

    /// Runs close callbacks exactly once and releases the socket. Ordering:
    /// the facade is marked closed first so no scheduled task can run user
    /// code after `on_close`.
    fn teardown(&mut self) {
        self.decoder.close();

        if let Some(mut ws) = self.ws.take() {
            ws.conn.mark_closed();
            ws.endpoint.on_close();
        }

        self.dispatcher.on_session_close();
        self.writer.close();
    }
}
