mod conn_decoder;
mod frame_codec;
mod handshake;
mod request_decoder;

pub use conn_decoder::{ConnEvent, ConnectionDecoder};
pub use frame_codec::{encode_frame, FrameDecoder, FrameEncoder, MAX_PAYLOAD_BYTES};
pub use handshake::{accept_key, upgrade_response, validate_upgrade};
pub use request_decoder::HttpRequestDecoder;
