use std::time::SystemTime;

use bytes::{BufMut, BytesMut};
use http::StatusCode;
use httpdate::fmt_http_date;

use crate::connection::{ConnectionWriter, SendResult};

const INIT_RESPONSE_SIZE: usize = 256;

/// Writes complete HTTP responses through the connection's send path.
///
/// Sending never blocks: the response either goes out inline or is queued
/// behind write-readiness, exactly like any other send on the connection.
pub struct ResponseWriter {
    writer: ConnectionWriter,
    /// Set when the request asked for teardown; the response echoes
    /// `Connection: close` so the peer knows not to reuse the connection.
    close_connection: bool,
}

impl ResponseWriter {
    pub(crate) fn new(writer: ConnectionWriter, close_connection: bool) -> Self {
        Self { writer, close_connection }
    }

    /// Sends a response with the given status, `Content-Type`, and body.
    /// `Content-Length` and `Date` are filled in, plus `Connection: close`
    /// when the connection is about to be torn down.
    pub fn send_response(&self, status: StatusCode, content_type: &str, body: impl AsRef<[u8]>) -> SendResult {
        let body = body.as_ref();

        let mut dst = BytesMut::with_capacity(INIT_RESPONSE_SIZE + body.len());
        dst.put_slice(b"HTTP/1.1 ");
        dst.put_slice(status.as_str().as_bytes());
        dst.put_slice(b" ");
        dst.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        dst.put_slice(b"\r\n");

        dst.put_slice(b"Content-Type: ");
        dst.put_slice(content_type.as_bytes());
        dst.put_slice(b"\r\n");

        dst.put_slice(b"Content-Length: ");
        dst.put_slice(body.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");

        if self.close_connection {
            dst.put_slice(b"Connection: close\r\n");
        }

        dst.put_slice(b"Date: ");
        dst.put_slice(fmt_http_date(SystemTime::now()).as_bytes());
        dst.put_slice(b"\r\n\r\n");

        dst.put_slice(body);
        self.writer.send(dst.freeze())
    }

    pub(crate) fn close_when_drained(&self) {
        self.writer.close_when_drained();
    }
}

#[cfg(test)]
mod tests {
    use tokio::runtime::Handle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::testing::CaptureStream;

    #[tokio::test]
    async fn renders_status_line_and_framing_headers() {
        let stream = CaptureStream::new();
        let writer = ConnectionWriter::new(stream.clone(), CancellationToken::new(), Handle::current());

        let result =
            ResponseWriter::new(writer, false).send_response(StatusCode::NOT_FOUND, "text/plain", "/missing Not Found");
        assert!(result.is_success());

        let text = String::from_utf8(stream.written()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 18\r\n"));
        assert!(text.contains("Date: "));
        assert!(!text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n/missing Not Found"));
    }

    #[tokio::test]
    async fn closing_response_echoes_connection_close() {
        let stream = CaptureStream::new();
        let writer = ConnectionWriter::new(stream.clone(), CancellationToken::new(), Handle::current());

        ResponseWriter::new(writer, true).send_response(StatusCode::OK, "text/plain", "bye");

        let text = String::from_utf8(stream.written()).unwrap();
        assert!(text.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn empty_body_has_zero_content_length() {
        let stream = CaptureStream::new();
        let writer = ConnectionWriter::new(stream.clone(), CancellationToken::new(), Handle::current());

        ResponseWriter::new(writer, false).send_response(StatusCode::OK, "text/html", "");

        let text = String::from_utf8(stream.written()).unwrap();
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[tokio::test]
    async fn send_after_close_reports_closed() {
        let stream = CaptureStream::new();
        let writer = ConnectionWriter::new(stream, CancellationToken::new(), Handle::current());
        writer.close();

        let result = ResponseWriter::new(writer, false).send_response(StatusCode::OK, "text/plain", "late");
        assert!(matches!(result, SendResult::Closed));
    }
}
