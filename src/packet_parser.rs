use bytes::{Buf, Bytes, BytesMut};
use crate::wire::FRAME_LENGTH_PREFIX_LEN;

/// Accumulates the reliable byte stream and cuts it into length-prefixed packets. Data is only
///  ever appended at the end and consumed at the front.
#[derive(Default)]
pub struct PacketParser {
    buf: BytesMut,
}

impl PacketParser {
    pub fn new() -> PacketParser {
        Default::default()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Extracts the next complete packet (without its length prefix), or returns `None` and
    ///  leaves the buffer untouched if the packet is not complete yet.
    pub fn get_packet(&mut self) -> Option<Bytes> {
        if self.buf.len() < FRAME_LENGTH_PREFIX_LEN {
            return None;
        }
        let packet_len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < FRAME_LENGTH_PREFIX_LEN + packet_len {
            return None;
        }

        self.buf.advance(FRAME_LENGTH_PREFIX_LEN);
        Some(self.buf.split_to(packet_len).freeze())
    }
}
