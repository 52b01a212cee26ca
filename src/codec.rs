use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{core::message::Packet, error::NetworkError};

/// The size of the packet header: a big-endian `u32` type followed by a big-endian `u32` length.
pub const PACKET_HEAD_SIZE: usize = 8;

/// The largest packet accepted, header included.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// A framed packet whose body hasn't been decoded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub kind: u32,
    pub body: BytesMut,
}

impl RawPacket {
    /// The size of the packet on the wire.
    pub fn size(&self) -> usize {
        PACKET_HEAD_SIZE + self.body.len()
    }
}

/// Frames packets as `type | length | body`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PacketCodec {
    type Item = RawPacket;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEAD_SIZE {
            return Ok(None);
        }

        let kind = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);

        // Checked in u64 so a length close to u32::MAX can't wrap.
        if len == 0 || len as u64 + PACKET_HEAD_SIZE as u64 > MAX_PACKET_SIZE as u64 {
            return Err(NetworkError::BadPacket(len));
        }

        let packet_size = PACKET_HEAD_SIZE + len as usize;
        if src.len() < packet_size {
            src.reserve(packet_size - src.len());
            return Ok(None);
        }

        src.advance(PACKET_HEAD_SIZE);
        let body = src.split_to(len as usize);

        Ok(Some(RawPacket { kind, body }))
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = NetworkError;

    fn encode(&mut self, packet: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = packet.encode_body()?;
        let size = PACKET_HEAD_SIZE + body.len();
        if size > MAX_PACKET_SIZE {
            return Err(NetworkError::PacketTooLarge(size));
        }

        dst.reserve(PACKET_HEAD_SIZE + body.len());
        dst.put_u32(packet.message_type() as u32);
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);

        Ok(())
    }
}

/// Frames a packet, ready to be handed to the transport.
pub fn encode_packet(packet: &Packet) -> Result<Bytes, NetworkError> {
    let mut dst = BytesMut::new();
    PacketCodec::new().encode(packet, &mut dst)?;

    Ok(dst.freeze())
}
