//! Wire format for the PV display transport.
//!
//! This crate owns packet framing (header, payload, footer, CRC-16/CCITT) and
//! the typed payload codecs for the control channel (negotiation, display
//! list maintenance) and per-display event channel (resolution changes,
//! cursor updates, blanking). It has no knowledge of how bytes actually move
//! between guest and host — that's `pv-display-transport`.

pub mod codec;
pub mod crc;
pub mod error;
pub mod footer;
pub mod header;
pub mod types;

pub use codec::{decode_one, encode, Packet, Reassembler};
pub use error::ProtocolError;
pub use footer::{Footer, FOOTER_SIZE};
pub use header::{Header, HEADER_SIZE, INTERFACE_VERSION, MAGIC1, MAGIC2, MAX_PACKET, MAX_PAYLOAD};
pub use types::{
    capability_flags, control, event, AddDisplay, BlankDisplay, BlankReason, DirtyRect,
    DisplayInfo, DisplayKey, DisplayList, DriverCapabilities, MoveCursor, SetDisplay, TextMode,
    UpdateCursor, CURSOR_HEIGHT, CURSOR_SIZE, CURSOR_STRIDE, CURSOR_WIDTH,
};
