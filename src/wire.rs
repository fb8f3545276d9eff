//! Datagram-level wire format.
//!
//! Two kinds of datagrams share the UDP socket: handshake packets, which are exchanged before an
//!  ARQ engine exists, and segments of the ARQ engine. They are told apart by their exact length
//!  and leading type word - an ARQ segment carries a 24 byte header, so it can never be 8 or 12
//!  bytes long.
//!
//! ```ascii
//! SYN (8 bytes, all LE):
//! 0: type = 1 (u32)
//! 4: local conn id of the initiator (u32)
//!
//! ACK (12 bytes, all LE):
//! 0: type = 2 (u32)
//! 4: request conn id - the initiator's id from the SYN (u32)
//! 8: acceptor conn id (u32)
//! ```
//!
//! Inside the reliable stream, every application packet is framed as
//!
//! ```ascii
//! 0: frame length (u16 LE), starting *after* the length
//! 2: opcode (u16 LE) - bit 15 is the compression flag, bits 0-14 the message type
//! 4: payload, compressed if the flag is set
//! ```

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const COMPRESSED_FLAG: u16 = 0x8000;
pub const OPCODE_MASK: u16 = 0x7fff;

pub const SYN_LEN: usize = 8;
pub const ACK_LEN: usize = 12;
pub const FRAME_LENGTH_PREFIX_LEN: usize = 2;
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum HandshakeKind {
    Syn = 1,
    Ack = 2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakePacket {
    Syn { local_conn_id: u32 },
    Ack { request_conn_id: u32, acceptor_conn_id: u32 },
}

impl HandshakePacket {
    pub fn ser(&self, buf: &mut BytesMut) {
        match *self {
            HandshakePacket::Syn { local_conn_id } => {
                buf.put_u32_le(HandshakeKind::Syn.into());
                buf.put_u32_le(local_conn_id);
            }
            HandshakePacket::Ack { request_conn_id, acceptor_conn_id } => {
                buf.put_u32_le(HandshakeKind::Ack.into());
                buf.put_u32_le(request_conn_id);
                buf.put_u32_le(acceptor_conn_id);
            }
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(ACK_LEN);
        self.ser(&mut buf);
        buf
    }

    /// Returns `None` for everything that is not a well-formed handshake packet
    pub fn deser(mut buf: &[u8]) -> Option<HandshakePacket> {
        let len = buf.len();
        if len != SYN_LEN && len != ACK_LEN {
            return None;
        }

        match (HandshakeKind::try_from(buf.get_u32_le()).ok()?, len) {
            (HandshakeKind::Syn, SYN_LEN) => Some(HandshakePacket::Syn {
                local_conn_id: buf.get_u32_le(),
            }),
            (HandshakeKind::Ack, ACK_LEN) => Some(HandshakePacket::Ack {
                request_conn_id: buf.get_u32_le(),
                acceptor_conn_id: buf.get_u32_le(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DatagramKind {
    Handshake(HandshakePacket),
    /// ARQ engine segment, carrying the engine's conversation id
    Segment { conv: u32 },
    Invalid,
}

pub fn classify_datagram(buf: &[u8]) -> DatagramKind {
    if let Some(handshake) = HandshakePacket::deser(buf) {
        return DatagramKind::Handshake(handshake);
    }
    if buf.len() < 4 {
        return DatagramKind::Invalid;
    }
    let mut b = buf;
    DatagramKind::Segment { conv: b.get_u32_le() }
}

/// `(opcode without flag, compressed)`
pub fn split_opcode(raw: u16) -> (u16, bool) {
    (raw & OPCODE_MASK, raw & COMPRESSED_FLAG != 0)
}
