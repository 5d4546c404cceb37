use std::net::SocketAddr;

use overlay_bufferpool::Resettable;

use crate::{FrameHeader, MAX_FRAME_LEN};

/// Scratch space for one packet as it moves through the pipeline: raw
/// on-wire bytes, the header once parsed, the decrypted/plaintext
/// region, and (for inbound buffers) the address it arrived from.
///
/// A single type serves both directions so one [`overlay_bufferpool::BufferPool`]
/// can back both the inbound and outbound queues described by the
/// concurrency model; which fields are populated depends on where in
/// the pipeline the buffer currently sits.
pub struct PacketBuffer {
    raw: Vec<u8>,
    raw_len: usize,
    pub header: Option<FrameHeader>,
    pub plaintext: Vec<u8>,
    pub remote: Option<SocketAddr>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self {
            raw: vec![0u8; MAX_FRAME_LEN],
            raw_len: 0,
            header: None,
            plaintext: Vec::with_capacity(MAX_FRAME_LEN),
            remote: None,
        }
    }

    /// The full-capacity scratch region, for a reader to fill before
    /// calling [`PacketBuffer::set_len`].
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.raw
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw[..self.raw_len]
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.raw.len(), "packet longer than buffer capacity");
        self.raw_len = len;
    }

    pub fn len(&self) -> usize {
        self.raw_len
    }

    pub fn is_empty(&self) -> bool {
        self.raw_len == 0
    }

    pub fn capacity(&self) -> usize {
        self.raw.len()
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for PacketBuffer {
    fn reset(&mut self) {
        self.raw[..self.raw_len].fill(0);
        self.raw_len = 0;
        self.header = None;
        self.plaintext.clear();
        self.remote = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_every_field() {
        let mut buf = PacketBuffer::new();
        buf.raw_mut()[0] = 0xAB;
        buf.set_len(4);
        buf.header = Some(FrameHeader::new(crate::FrameType::Data, 1, 0));
        buf.plaintext.extend_from_slice(b"hi");
        buf.remote = Some("127.0.0.1:1".parse().unwrap());

        buf.reset();

        assert_eq!(buf.len(), 0);
        assert!(buf.header.is_none());
        assert!(buf.plaintext.is_empty());
        assert!(buf.remote.is_none());
        assert_eq!(buf.raw()[..0].len(), 0);
    }

    #[test]
    fn fresh_buffer_has_mtu_sized_capacity() {
        let buf = PacketBuffer::new();
        assert_eq!(buf.capacity(), MAX_FRAME_LEN);
    }
}
