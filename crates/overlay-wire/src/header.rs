pub const HEADER_LEN: usize = 16;

const VERSION: u8 = 1;
const PADDING: u16 = 0xFEED;

/// The type byte of a frame header.
///
/// `Handshake` and `Data` are the two types actually produced by this
/// workspace's own peer state machine; the remainder round out the
/// wire format's type space so a future extension (keepalive punch,
/// rekey, explicit close) doesn't need a breaking header change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Handshake,
    Data,
    Reset,
    Rekey,
    Close,
    Discovery,
    Punch,
}

impl FrameType {
    fn to_byte(self) -> u8 {
        match self {
            FrameType::Handshake => 1,
            FrameType::Data => 2,
            FrameType::Reset => 3,
            FrameType::Rekey => 4,
            FrameType::Close => 5,
            FrameType::Discovery => 6,
            FrameType::Punch => 0xff,
        }
    }

    fn from_byte(b: u8) -> Result<Self, HeaderError> {
        match b {
            1 => Ok(FrameType::Handshake),
            2 => Ok(FrameType::Data),
            3 => Ok(FrameType::Reset),
            4 => Ok(FrameType::Rekey),
            5 => Ok(FrameType::Close),
            6 => Ok(FrameType::Discovery),
            0xff => Ok(FrameType::Punch),
            other => Err(HeaderError::UnknownType(other)),
        }
    }
}

/// The fixed 16-byte header prefixing every frame sent over an
/// established ICE connection.
///
/// ```text
/// offset 0  : version u8 = 0x01
/// offset 1  : type    u8
/// offset 2  : sender  u32 big-endian
/// offset 6  : counter u64 big-endian
/// offset 14 : padding u16 big-endian = 0xFEED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    /// The sender's own peer id, so the receiver can demultiplex
    /// without consulting the transport-level source address.
    pub sender: u32,
    /// The Noise transport nonce for `Data` frames, or the handshake
    /// step ordinal (0, 1) for `Handshake` frames.
    pub counter: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("frame shorter than the {HEADER_LEN}-byte header")]
    TooShort,
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame type byte {0:#x}")]
    UnknownType(u8),
    #[error("padding bytes did not match the expected constant")]
    BadPadding,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, sender: u32, counter: u64) -> Self {
        Self {
            frame_type,
            sender,
            counter,
        }
    }

    /// Writes the header into the first [`HEADER_LEN`] bytes of `out`.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than [`HEADER_LEN`]; callers always
    /// operate on a buffer sized to at least [`crate::MAX_FRAME_LEN`].
    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= HEADER_LEN, "buffer too small for frame header");

        out[0] = VERSION;
        out[1] = self.frame_type.to_byte();
        out[2..6].copy_from_slice(&self.sender.to_be_bytes());
        out[6..14].copy_from_slice(&self.counter.to_be_bytes());
        out[14..16].copy_from_slice(&PADDING.to_be_bytes());
    }

    pub fn decode(input: &[u8]) -> Result<Self, HeaderError> {
        if input.len() < HEADER_LEN {
            return Err(HeaderError::TooShort);
        }

        let version = input[0];
        if version != VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        let frame_type = FrameType::from_byte(input[1])?;
        let sender = u32::from_be_bytes(input[2..6].try_into().expect("slice is 4 bytes"));
        let counter = u64::from_be_bytes(input[6..14].try_into().expect("slice is 8 bytes"));
        let padding = u16::from_be_bytes(input[14..16].try_into().expect("slice is 2 bytes"));

        if padding != PADDING {
            return Err(HeaderError::BadPadding);
        }

        Ok(Self {
            frame_type,
            sender,
            counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_frame_type() {
        let types = [
            FrameType::Handshake,
            FrameType::Data,
            FrameType::Reset,
            FrameType::Rekey,
            FrameType::Close,
            FrameType::Discovery,
            FrameType::Punch,
        ];

        for frame_type in types {
            let header = FrameHeader::new(frame_type, 42, 7);
            let mut buf = [0u8; HEADER_LEN];
            header.encode(&mut buf);
            assert_eq!(FrameHeader::decode(&buf).unwrap(), header);
        }
    }

    #[test]
    fn rejects_short_input() {
        let buf = [0u8; HEADER_LEN - 1];
        assert_eq!(FrameHeader::decode(&buf), Err(HeaderError::TooShort));
    }

    #[test]
    fn rejects_wrong_version() {
        let header = FrameHeader::new(FrameType::Data, 1, 0);
        let mut buf = [0u8; HEADER_LEN];
        header.encode(&mut buf);
        buf[0] = 2;
        assert_eq!(
            FrameHeader::decode(&buf),
            Err(HeaderError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn rejects_bad_padding() {
        let header = FrameHeader::new(FrameType::Data, 1, 0);
        let mut buf = [0u8; HEADER_LEN];
        header.encode(&mut buf);
        buf[14] = 0;
        buf[15] = 0;
        assert_eq!(FrameHeader::decode(&buf), Err(HeaderError::BadPadding));
    }

    #[test]
    fn rejects_unknown_type() {
        let header = FrameHeader::new(FrameType::Data, 1, 0);
        let mut buf = [0u8; HEADER_LEN];
        header.encode(&mut buf);
        buf[1] = 0x42;
        assert_eq!(FrameHeader::decode(&buf), Err(HeaderError::UnknownType(0x42)));
    }
}
