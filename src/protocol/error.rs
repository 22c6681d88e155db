//! Error types for HTTP and WebSocket protocol handling
//!
//! [`ParseError`] covers everything that can go wrong with inbound bytes,
//! [`SendError`] the outbound side. Connection processing converts both into
//! lifecycle events rather than surfacing them: handler authors only ever
//! see typed callbacks.

use std::io;
use thiserror::Error;

/// Errors that occur while parsing HTTP requests or WebSocket frames
#[derive(Error, Debug)]
pub enum ParseError {
    /// Header size exceeds the maximum allowed size
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    /// Number of headers exceeds the maximum allowed
    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    /// Invalid header format or content
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    /// Unsupported HTTP version
    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    /// Invalid or unsupported HTTP method
    #[error("invalid http method")]
    InvalidMethod,

    /// Invalid URI format
    #[error("invalid http uri")]
    InvalidUri,

    /// Invalid Content-Length header
    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    /// Request body exceeds the maximum allowed size
    #[error("body size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeBody { current_size: u64, max_size: u64 },

    /// Malformed WebSocket frame
    #[error("invalid websocket frame: {reason}")]
    InvalidFrame { reason: String },

    /// Unknown WebSocket opcode
    #[error("unknown websocket opcode: 0x{0:X}")]
    InvalidOpcode(u8),

    /// WebSocket frame payload exceeds the maximum allowed size
    #[error("frame payload too large, current: {current_size} exceed the limit {max_size}")]
    TooLargePayload { current_size: u64, max_size: u64 },

    /// Text frame payload is not valid UTF-8
    #[error("text frame is not valid utf-8")]
    InvalidUtf8,

    /// Malformed WebSocket upgrade request
    #[error("invalid websocket handshake: {reason}")]
    InvalidHandshake { reason: String },

    /// I/O error during parsing
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    /// Creates a new TooLargeHeader error
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    /// Creates a new TooManyHeaders error
    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    /// Creates a new InvalidHeader error
    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    /// Creates a new InvalidContentLength error
    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    /// Creates a new TooLargeBody error
    pub fn too_large_body(current_size: u64, max_size: u64) -> Self {
        Self::TooLargeBody { current_size, max_size }
    }

    /// Creates a new InvalidFrame error
    pub fn invalid_frame<S: ToString>(str: S) -> Self {
        Self::InvalidFrame { reason: str.to_string() }
    }

    /// Creates a new TooLargePayload error
    pub fn too_large_payload(current_size: u64, max_size: u64) -> Self {
        Self::TooLargePayload { current_size, max_size }
    }

    /// Creates a new InvalidHandshake error
    pub fn invalid_handshake<S: ToString>(str: S) -> Self {
        Self::InvalidHandshake { reason: str.to_string() }
    }
}

/// Errors that occur while encoding or sending outbound data
#[derive(Error, Debug)]
pub enum SendError {
    /// Invalid outbound frame or response
    #[error("invalid outbound data: {reason}")]
    InvalidData { reason: String },

    /// I/O error during sending
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    /// Creates a new InvalidData error
    pub fn invalid_data<S: ToString>(str: S) -> Self {
        Self::InvalidData { reason: str.to_string() }
    }
}
