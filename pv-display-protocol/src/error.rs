use thiserror::Error;

/// Failures that can occur while encoding or decoding a wire packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("bad magic bytes: got {magic1:#06x}/{magic2:#06x}")]
    BadMagic { magic1: u16, magic2: u16 },

    #[error("header declares length {declared} which exceeds the maximum payload of {max}")]
    LengthOutOfRange { declared: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    CrcMismatch { expected: u16, computed: u16 },

    #[error("buffer too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}
