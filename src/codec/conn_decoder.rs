use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::{FrameDecoder, HttpRequestDecoder};
use crate::protocol::{Frame, HttpRequest, ParseError};

/// A completed logical event produced by the connection read state machine.
#[derive(Debug)]
pub enum ConnEvent {
    /// A complete HTTP request (head plus collected body).
    Request(HttpRequest),
    /// A single WebSocket frame, payload unmasked.
    Frame(Frame),
}

/// The per-connection read state machine.
///
/// Every connection starts in HTTP mode; the router switches it to WebSocket
/// mode via [`upgrade`](ConnectionDecoder::upgrade) once a handshake has been
/// accepted. `close` makes the decoder absorbing: no further events are
/// produced regardless of buffered bytes.
pub struct ConnectionDecoder {
    state: ReadState,
}

enum ReadState {
    Http(HttpRequestDecoder),
    WebSocket(FrameDecoder),
    Closed,
}

impl ConnectionDecoder {
    pub fn new() -> Self {
        Self { state: ReadState::Http(HttpRequestDecoder::new()) }
    }

    /// Transitions from HTTP parsing to WebSocket frame parsing. Bytes
    /// already buffered past the upgrade request are frame bytes.
    pub fn upgrade(&mut self) {
        self.state = ReadState::WebSocket(FrameDecoder::new());
    }

    /// Stops event production permanently.
    pub fn close(&mut self) {
        self.state = ReadState::Closed;
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.state, ReadState::WebSocket(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ReadState::Closed)
    }
}

impl Default for ConnectionDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ConnectionDecoder {
    type Item = ConnEvent;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.state {
            ReadState::Http(decoder) => Ok(decoder.decode(src)?.map(ConnEvent::Request)),
            ReadState::WebSocket(decoder) => Ok(decoder.decode(src)?.map(ConnEvent::Frame)),
            ReadState::Closed => {
                // absorbing: discard anything the peer still sends
                src.clear();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use indoc::indoc;

    use super::*;
    use crate::codec::encode_frame;
    use crate::protocol::Opcode;

    #[test]
    fn upgrade_switches_to_frames() {
        let mut decoder = ConnectionDecoder::new();
        let mut buf = BytesMut::new();

        buf.put_slice(
            indoc! {r##"
            GET /ws HTTP/1.1
            Upgrade: websocket
            Connection: Upgrade
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==

            "##}
            .as_bytes(),
        );
        // frame bytes arriving in the same read as the upgrade request
        buf.put_slice(&encode_frame(Opcode::Text, b"early", Some([9, 9, 9, 9])).unwrap());

        let Some(ConnEvent::Request(request)) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected request event");
        };
        assert_eq!(request.path(), "/ws");

        decoder.upgrade();
        assert!(decoder.is_websocket());

        let Some(ConnEvent::Frame(frame)) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected frame event");
        };
        assert_eq!(&frame.payload[..], b"early");
    }

    #[test]
    fn closed_decoder_produces_nothing() {
        let mut decoder = ConnectionDecoder::new();
        decoder.close();

        let mut buf = BytesMut::from("GET / HTTP/1.1\r\n\r\n");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(decoder.is_closed());
    }

    #[test]
    fn sequential_requests_before_upgrade() {
        let mut decoder = ConnectionDecoder::new();
        let mut buf = BytesMut::from("GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        let Some(ConnEvent::Request(a)) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(a.path(), "/a");

        let Some(ConnEvent::Request(b)) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(b.path(), "/b");
    }
}
