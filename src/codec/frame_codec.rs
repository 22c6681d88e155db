use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::ensure;
use crate::protocol::{Frame, FrameHeader, Opcode, ParseError, SendError, SizeClass};

/// Per-frame payload cap. Larger frames are a protocol error.
pub const MAX_PAYLOAD_BYTES: u64 = 16 * 1024 * 1024;

/// Decoder for WebSocket frames (RFC 6455 §5.2).
///
/// Decoding is two-phase: the fixed prefix plus extended length and masking
/// key first, then the payload once `payload_len` bytes have arrived. The
/// parsed header is held between calls so partial payloads never re-parse.
pub struct FrameDecoder {
    header: Option<FrameHeader>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { header: None }
    }

    fn decode_header(&mut self, src: &mut BytesMut) -> Result<Option<FrameHeader>, ParseError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];

        let fin = first & 0x80 != 0;
        ensure!(first & 0x70 == 0, ParseError::invalid_frame("reserved bits must be zero"));
        let opcode = Opcode::from_u8(first)?;

        let masked = second & 0x80 != 0;
        let len_code = second & 0x7F;

        let ext_len = match len_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_len = 2 + ext_len + if masked { 4 } else { 0 };
        if src.len() < header_len {
            src.reserve(header_len - src.len());
            return Ok(None);
        }

        let payload_len = match len_code {
            126 => u16::from_be_bytes([src[2], src[3]]) as u64,
            127 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(bytes);
                ensure!(len & (1 << 63) == 0, ParseError::invalid_frame("length high bit must be zero"));
                len
            }
            direct => direct as u64,
        };

        if opcode.is_control() {
            ensure!(fin, ParseError::invalid_frame("control frames must not be fragmented"));
            ensure!(payload_len <= 125, ParseError::invalid_frame("control frame payload exceeds 125 bytes"));
        }
        ensure!(payload_len <= MAX_PAYLOAD_BYTES, ParseError::too_large_payload(payload_len, MAX_PAYLOAD_BYTES));

        let mask = if masked {
            let offset = 2 + ext_len;
            Some([src[offset], src[offset + 1], src[offset + 2], src[offset + 3]])
        } else {
            None
        };

        src.advance(header_len);
        trace!(?opcode, fin, masked, payload_len, "decoded frame header");
        Ok(Some(FrameHeader { fin, opcode, masked, payload_len, mask }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.header {
            Some(header) => header,
            None => match self.decode_header(src)? {
                Some(header) => {
                    self.header = Some(header);
                    header
                }
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_len as usize;
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            return Ok(None);
        }

        let mut payload = src.split_to(payload_len);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }

        self.header = None;
        Ok(Some(Frame { header, payload: payload.freeze() }))
    }
}

/// XOR the payload with the 4-byte masking key (RFC 6455 §5.3). Involutive:
/// applying it twice restores the input.
pub(crate) fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encoder for single-frame WebSocket messages.
///
/// FIN is always set; outbound messages are never fragmented. Control frames
/// carrying more than 125 bytes are refused (RFC 6455 §5.5) rather than put
/// on the wire for the peer to reject.
pub struct FrameEncoder;

impl Encoder<(Opcode, Bytes, Option<[u8; 4]>)> for FrameEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (Opcode, Bytes, Option<[u8; 4]>), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (opcode, payload, mask) = item;
        ensure!(
            !opcode.is_control() || payload.len() <= 125,
            SendError::invalid_data(format!("control frame payload is {} bytes, limit 125", payload.len()))
        );
        let size = SizeClass::find(payload.len());

        dst.reserve(1 + size.header_bytes() + if mask.is_some() { 4 } else { 0 } + payload.len());
        dst.put_u8(0x80 | opcode.to_u8());

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        match size {
            SizeClass::Small => dst.put_u8(mask_bit | payload.len() as u8),
            SizeClass::Medium => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(payload.len() as u16);
            }
            SizeClass::Large => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(payload.len() as u64);
            }
        }

        match mask {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(&payload),
        }

        Ok(())
    }
}

/// Builds one complete frame as a standalone buffer, ready for the writer.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Result<Bytes, SendError> {
    let mut dst = BytesMut::new();
    FrameEncoder.encode((opcode, Bytes::copy_from_slice(payload), mask), &mut dst)?;
    Ok(dst.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Frame {
        let mut buf = BytesMut::from(bytes);
        let frame = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        frame
    }

    #[test]
    fn masked_text_frame_round_trip() {
        let key = [0x37, 0xFA, 0x21, 0x3D];
        let encoded = encode_frame(Opcode::Text, b"hello", Some(key)).unwrap();

        let frame = decode_all(&encoded);
        assert_eq!(frame.header.opcode, Opcode::Text);
        assert!(frame.header.fin);
        assert!(frame.header.masked);
        assert_eq!(frame.header.mask, Some(key));
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[test]
    fn unmasked_frame_layout() {
        let encoded = encode_frame(Opcode::Text, b"hello", None).unwrap();
        assert_eq!(&encoded[..], &[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn medium_frame_uses_two_byte_length() {
        let payload = vec![0xAB; 300];
        let encoded = encode_frame(Opcode::Binary, &payload, None).unwrap();

        assert_eq!(encoded[0], 0x82);
        assert_eq!(encoded[1], 126);
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), 300);

        let frame = decode_all(&encoded);
        assert_eq!(frame.header.payload_len, 300);
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn large_frame_uses_eight_byte_length() {
        let payload = vec![0x42; 100_000];
        let encoded = encode_frame(Opcode::Binary, &payload, None).unwrap();

        assert_eq!(encoded[0], 0x82);
        assert_eq!(encoded[1], 127);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&encoded[2..10]);
        assert_eq!(u64::from_be_bytes(bytes), 100_000);

        let frame = decode_all(&encoded);
        assert_eq!(frame.header.payload_len, 100_000);
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn empty_close_frame() {
        let encoded = encode_frame(Opcode::Close, &[], None).unwrap();
        assert_eq!(&encoded[..], &[0x88, 0x00]);

        let frame = decode_all(&encoded);
        assert_eq!(frame.header.opcode, Opcode::Close);
        assert_eq!(frame.header.payload_len, 0);
    }

    #[test]
    fn partial_header_then_payload() {
        let key = [1, 2, 3, 4];
        let encoded = encode_frame(Opcode::Text, b"split me", Some(key)).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        // only the first byte of the header
        buf.extend_from_slice(&encoded[..1]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        // header complete, payload still short
        buf.extend_from_slice(&encoded[1..8]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[8..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"split me");
    }

    #[test]
    fn reserved_bits_rejected() {
        let mut buf = BytesMut::from(&[0xC1, 0x00][..]);
        assert!(FrameDecoder::new().decode(&mut buf).is_err());
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        // PING without FIN
        let mut buf = BytesMut::from(&[0x09, 0x00][..]);
        assert!(FrameDecoder::new().decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_control_payload_rejected() {
        let mut buf = BytesMut::from(&[0x89, 126, 0x01, 0x00][..]);
        assert!(FrameDecoder::new().decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_control_payload_rejected_on_encode() {
        let payload = vec![0u8; 126];
        assert!(encode_frame(Opcode::Ping, &payload, None).is_err());
        assert!(encode_frame(Opcode::Close, &payload, None).is_err());

        // data frames of the same size are fine
        assert!(encode_frame(Opcode::Binary, &payload, None).is_ok());
    }

    #[test]
    fn payload_above_cap_rejected() {
        let mut header = vec![0x82, 127];
        header.extend_from_slice(&(MAX_PAYLOAD_BYTES + 1).to_be_bytes());
        let mut buf = BytesMut::from(&header[..]);
        assert!(FrameDecoder::new().decode(&mut buf).is_err());
    }

    #[test]
    fn length_high_bit_rejected() {
        let mut header = vec![0x82, 127];
        header.extend_from_slice(&(u64::MAX).to_be_bytes());
        let mut buf = BytesMut::from(&header[..]);
        assert!(FrameDecoder::new().decode(&mut buf).is_err());
    }

    #[test]
    fn mask_is_involutive() {
        let key = [0xDE, 0xAD, 0xBE, 0xEF];
        let mut data = b"some payload bytes".to_vec();
        let original = data.clone();

        apply_mask(&mut data, key);
        assert_ne!(data, original);
        apply_mask(&mut data, key);
        assert_eq!(data, original);
    }
}
