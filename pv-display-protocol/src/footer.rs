use crate::error::ProtocolError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// On-wire footer: `u16 crc, u16 reserved, u32 reserved`.
pub const FOOTER_SIZE: usize = 2 + 2 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub crc: u16,
}

impl Footer {
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.write_u16::<LittleEndian>(self.crc).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < FOOTER_SIZE {
            return Err(ProtocolError::Truncated {
                need: FOOTER_SIZE,
                have: bytes.len(),
            });
        }
        let mut cur = Cursor::new(bytes);
        let crc = cur.read_u16::<LittleEndian>().unwrap();
        Ok(Footer { crc })
    }
}
