//! Codec for framing packets on a tunnel stream

use crate::packet::Packet;
use crate::MAX_PACKET_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Packet codec
///
/// Format: [length: u32 big-endian][payload: bincode serialized packet]
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    const HEADER_SIZE: usize = 4;

    /// Encode a packet to a standalone frame
    pub fn encode_frame(packet: &Packet) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        PacketCodec.encode(packet, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one packet from the front of `buf`
    ///
    /// Returns Ok(None) if more data is needed.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        PacketCodec.decode(buf)
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, packet: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(packet)?;

        if payload.len() > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge(payload.len()));
        }

        dst.reserve(Self::HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge(length));
        }

        if src.len() < Self::HEADER_SIZE + length {
            src.reserve(Self::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let payload = src.split_to(length);

        Ok(Some(bincode::deserialize(&payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ControlCode;

    #[test]
    fn test_decode_incomplete() {
        let packet = Packet::data(42, b"GET / HTTP/1.1\r\n\r\n".to_vec());
        let encoded = PacketCodec::encode_frame(&packet).unwrap();

        // Only the length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(PacketCodec::decode_frame(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(PacketCodec::decode_frame(&mut buf).unwrap(), Some(packet));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let first = Packet::data(1, Vec::new());
        let second = Packet::error(2, "upstream unreachable");

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&PacketCodec::encode_frame(&first).unwrap());
        buf.extend_from_slice(&PacketCodec::encode_frame(&second).unwrap());

        let decoded_first = PacketCodec::decode_frame(&mut buf).unwrap().unwrap();
        let decoded_second = PacketCodec::decode_frame(&mut buf).unwrap().unwrap();

        assert_eq!(decoded_first, first);
        assert_eq!(decoded_second.code, ControlCode::Error);
        assert_eq!(decoded_second.error_message, "upstream unreachable");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_length_header_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_PACKET_SIZE + 1) as u32);
        assert!(matches!(
            PacketCodec::decode_frame(&mut buf),
            Err(CodecError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_control_code_is_an_error() {
        let packet = Packet::data(5, b"x".to_vec());
        let mut payload = bincode::serialize(&packet).unwrap();
        // conn_id (8 bytes) is followed by the u32 variant index of the code
        payload[8..12].copy_from_slice(&9u32.to_le_bytes());

        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        assert!(matches!(
            PacketCodec::decode_frame(&mut buf),
            Err(CodecError::SerializationError(_))
        ));
    }
}
