use crate::error::ProtocolError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// First magic word, identifying the start of a Display Handler packet.
pub const MAGIC1: u16 = 0xC0DE;
/// Second magic word.
pub const MAGIC2: u16 = 0x5AFE;

/// Protocol interface version carried in `driver_capabilities`.
pub const INTERFACE_VERSION: u32 = 0x0000_0001;

/// Maximum total packet size (header + payload + footer), in bytes.
pub const MAX_PACKET: usize = 4096;

/// On-wire header: `u16 magic1, u16 magic2, u32 type, u32 length, u32 reserved`.
pub const HEADER_SIZE: usize = 2 + 2 + 4 + 4 + 4;

/// Maximum payload a single packet may carry, leaving room for header and footer.
pub const MAX_PAYLOAD: usize = MAX_PACKET - HEADER_SIZE - crate::footer::FOOTER_SIZE;

/// Decoded packet header. `length == 0` is a legitimate value (an empty-payload
/// packet); reassembly code uses a separate `Option<Header>` to track
/// "no packet in progress", rather than overloading this field as the source does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: u32,
    pub length: u32,
}

impl Header {
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.write_u16::<LittleEndian>(MAGIC1).unwrap();
        out.write_u16::<LittleEndian>(MAGIC2).unwrap();
        out.write_u32::<LittleEndian>(self.packet_type).unwrap();
        out.write_u32::<LittleEndian>(self.length).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap(); // reserved
    }

    /// Parses a header from exactly `HEADER_SIZE` bytes, validating magics and the
    /// declared length against `MAX_PAYLOAD`.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                need: HEADER_SIZE,
                have: bytes.len(),
            });
        }

        let mut cur = Cursor::new(bytes);
        let magic1 = cur.read_u16::<LittleEndian>().unwrap();
        let magic2 = cur.read_u16::<LittleEndian>().unwrap();
        if magic1 != MAGIC1 || magic2 != MAGIC2 {
            return Err(ProtocolError::BadMagic { magic1, magic2 });
        }

        let packet_type = cur.read_u32::<LittleEndian>().unwrap();
        let length = cur.read_u32::<LittleEndian>().unwrap();
        let _reserved = cur.read_u32::<LittleEndian>().unwrap();

        if length as usize > MAX_PAYLOAD {
            return Err(ProtocolError::LengthOutOfRange {
                declared: length,
                max: MAX_PAYLOAD as u32,
            });
        }

        Ok(Header {
            packet_type,
            length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let h = Header {
            packet_type: 7,
            length: 42,
        };
        let mut buf = Vec::new();
        h.write_to(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        let parsed = Header::parse(&buf).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0] = 0xAB;
        assert!(matches!(
            Header::parse(&buf),
            Err(ProtocolError::BadMagic { .. })
        ));
    }

    #[test]
    fn rejects_oversize_length() {
        let h = Header {
            packet_type: 1,
            length: (MAX_PAYLOAD + 1) as u32,
        };
        let mut buf = Vec::new();
        h.write_to(&mut buf);
        assert!(matches!(
            Header::parse(&buf),
            Err(ProtocolError::LengthOutOfRange { .. })
        ));
    }
}
