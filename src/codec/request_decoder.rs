use std::mem::MaybeUninit;

use bytes::{Buf, Bytes, BytesMut};
use http::{Request, Version};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{HttpRequest, ParseError};

const MAX_HEADER_NUM: usize = 64;
const MAX_HEADER_BYTES: usize = 8 * 1024;
const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// Decoder for complete HTTP requests: request line, headers, then an
/// optional Content-Length body.
///
/// The decoder holds the in-flight request head while its body is collected,
/// so a single instance drives any number of sequential keep-alive requests.
pub struct HttpRequestDecoder {
    state: State,
}

enum State {
    Head,
    Body { head: Request<()>, remaining: u64, collected: BytesMut },
}

impl HttpRequestDecoder {
    pub fn new() -> Self {
        Self { state: State::Head }
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<HttpRequest>, ParseError> {
        let mut req = httparse::Request::new(&mut []);
        let mut headers: [MaybeUninit<httparse::Header>; MAX_HEADER_NUM] =
            unsafe { MaybeUninit::uninit().assume_init() };

        let parsed_result = req.parse_with_uninit_headers(src, &mut headers).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            e => ParseError::invalid_header(e.to_string()),
        });

        match parsed_result? {
            Status::Complete(body_offset) => {
                trace!(head_size = body_offset, "parsed request head");
                ensure!(body_offset <= MAX_HEADER_BYTES, ParseError::too_large_header(body_offset, MAX_HEADER_BYTES));

                let version = match req.version {
                    Some(0) => Version::HTTP_10,
                    Some(1) => Version::HTTP_11,
                    // http2/3 run a different wire protocol entirely
                    _ => return Err(ParseError::InvalidVersion(req.version)),
                };

                let mut builder = Request::builder()
                    .method(req.method.ok_or(ParseError::InvalidMethod)?)
                    .uri(req.path.ok_or(ParseError::InvalidUri)?)
                    .version(version);

                if let Some(headers) = builder.headers_mut() {
                    headers.reserve(req.headers.len());
                }
                for header in req.headers.iter() {
                    builder = builder.header(header.name, header.value);
                }

                let head = builder.body(()).map_err(|e| ParseError::invalid_header(e.to_string()))?;
                src.advance(body_offset);

                let remaining = content_length(&head)?;
                ensure!(remaining <= MAX_BODY_BYTES, ParseError::too_large_body(remaining, MAX_BODY_BYTES));

                if remaining == 0 {
                    return Ok(Some(HttpRequest::from(head.map(|_| Bytes::new()))));
                }

                self.state =
                    State::Body { head, remaining, collected: BytesMut::with_capacity(remaining as usize) };
                Ok(None)
            }
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                Ok(None)
            }
        }
    }
}

impl Default for HttpRequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for HttpRequestDecoder {
    type Item = HttpRequest;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if matches!(self.state, State::Head) {
                if src.is_empty() {
                    return Ok(None);
                }
                if let Some(request) = self.decode_head(src)? {
                    return Ok(Some(request));
                }
                if matches!(self.state, State::Head) {
                    // head still partial, wait for more bytes
                    return Ok(None);
                }
                continue;
            }

            let State::Body { remaining, collected, .. } = &mut self.state else {
                unreachable!("head state handled above");
            };

            let take = (*remaining).min(src.len() as u64) as usize;
            collected.extend_from_slice(&src.split_to(take));
            *remaining -= take as u64;

            if *remaining > 0 {
                return Ok(None);
            }

            let State::Body { head, collected, .. } = std::mem::replace(&mut self.state, State::Head) else {
                unreachable!("body state checked above");
            };
            let body = collected.freeze();
            return Ok(Some(HttpRequest::from(head.map(|_| body))));
        }
    }
}

fn content_length(head: &Request<()>) -> Result<u64, ParseError> {
    if head.headers().get(http::header::TRANSFER_ENCODING).is_some() {
        // ingress chunked framing is unsupported
        return Err(ParseError::invalid_content_length("transfer-encoding is not supported on requests"));
    }

    match head.headers().get(http::header::CONTENT_LENGTH) {
        None => Ok(0),
        Some(value) => {
            let str = value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
            str.trim().parse::<u64>().map_err(|_| ParseError::invalid_content_length(format!("value {str} is not u64")))
        }
    }
}
