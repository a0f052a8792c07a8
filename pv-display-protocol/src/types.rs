//! Packet type constants and payload codecs for the control and event channels.

use crate::error::ProtocolError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Control-channel packet types.
pub mod control {
    pub const NONE: u32 = 0;
    pub const DRIVER_CAPABILITIES: u32 = 1;
    pub const HOST_DISPLAY_LIST: u32 = 2;
    pub const ADVERTISED_DISPLAY_LIST: u32 = 3;
    pub const ADD_DISPLAY: u32 = 4;
    pub const REMOVE_DISPLAY: u32 = 5;
    pub const DISPLAY_NO_LONGER_AVAILABLE: u32 = 6;
    pub const TEXT_MODE: u32 = 7;
    pub const END: u32 = 8;
}

/// Per-display event-channel packet types.
pub mod event {
    pub const NONE: u32 = 100;
    pub const SET_DISPLAY: u32 = 101;
    pub const UPDATE_CURSOR: u32 = 102;
    pub const MOVE_CURSOR: u32 = 103;
    pub const BLANK_DISPLAY: u32 = 104;
    pub const END: u32 = 105;
}

/// Bits of [`DriverCapabilities::flags`].
pub mod capability_flags {
    pub const LINEAR_FRAMEBUFFER: u32 = 1 << 0;
    pub const HARDWARE_CURSOR: u32 = 1 << 1;
    pub const RESIZE: u32 = 1 << 2;
    pub const RECONNECT: u32 = 1 << 3;
    pub const HOTPLUG: u32 = 1 << 4;
    pub const BLANKING: u32 = 1 << 5;
}

fn need(bytes: &[u8], n: usize) -> Result<(), ProtocolError> {
    if bytes.len() < n {
        Err(ProtocolError::Truncated {
            need: n,
            have: bytes.len(),
        })
    } else {
        Ok(())
    }
}

/// Advertised by the provider during negotiation: protocol version, maximum
/// display count, and a bitmap of optional features (see [`capability_flags`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub version: u32,
    pub max_displays: u32,
    pub flags: u32,
}

impl DriverCapabilities {
    pub const WIRE_SIZE: usize = 4 + 4 + 4 + 4;

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.write_u32::<LittleEndian>(self.version).unwrap();
        out.write_u32::<LittleEndian>(self.max_displays).unwrap();
        out.write_u32::<LittleEndian>(self.flags).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap(); // reserved
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        need(bytes, Self::WIRE_SIZE)?;
        let mut cur = Cursor::new(bytes);
        let version = cur.read_u32::<LittleEndian>().unwrap();
        let max_displays = cur.read_u32::<LittleEndian>().unwrap();
        let flags = cur.read_u32::<LittleEndian>().unwrap();
        Ok(Self {
            version,
            max_displays,
            flags,
        })
    }
}

/// One entry in a host-display-list or advertised-display-list payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayInfo {
    pub key: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DisplayInfo {
    pub const WIRE_SIZE: usize = 4 + 4 + 4 + 4 + 4 + 4;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.key).unwrap();
        out.write_u32::<LittleEndian>(self.x).unwrap();
        out.write_u32::<LittleEndian>(self.y).unwrap();
        out.write_u32::<LittleEndian>(self.width).unwrap();
        out.write_u32::<LittleEndian>(self.height).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap(); // reserved
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        need(bytes, Self::WIRE_SIZE)?;
        let mut cur = Cursor::new(bytes);
        let key = cur.read_u32::<LittleEndian>().unwrap();
        let x = cur.read_u32::<LittleEndian>().unwrap();
        let y = cur.read_u32::<LittleEndian>().unwrap();
        let width = cur.read_u32::<LittleEndian>().unwrap();
        let height = cur.read_u32::<LittleEndian>().unwrap();
        Ok(Self {
            key,
            x,
            y,
            width,
            height,
        })
    }
}

/// A list of displays: `host_display_list` (consumer → provider) and
/// `advertised_display_list` (provider → consumer) share this wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayList {
    pub displays: Vec<DisplayInfo>,
}

impl DisplayList {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.displays.len() * DisplayInfo::WIRE_SIZE);
        out.write_u32::<LittleEndian>(self.displays.len() as u32)
            .unwrap();
        for d in &self.displays {
            d.encode(&mut out);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        need(bytes, 4)?;
        let mut cur = Cursor::new(bytes);
        let count = cur.read_u32::<LittleEndian>().unwrap() as usize;
        let mut displays = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            need(&bytes[offset..], DisplayInfo::WIRE_SIZE)?;
            displays.push(DisplayInfo::decode(&bytes[offset..])?);
            offset += DisplayInfo::WIRE_SIZE;
        }
        Ok(Self { displays })
    }
}

/// Sent by the consumer to request that a display be brought up, carrying the
/// channel identifiers the provider should connect to next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddDisplay {
    pub key: u32,
    pub event_port: u32,
    pub framebuffer_port: u32,
    pub dirty_rectangles_port: u32,
    pub cursor_bitmap_port: u32,
}

impl AddDisplay {
    pub const WIRE_SIZE: usize = 4 * 5;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.write_u32::<LittleEndian>(self.key).unwrap();
        out.write_u32::<LittleEndian>(self.event_port).unwrap();
        out.write_u32::<LittleEndian>(self.framebuffer_port)
            .unwrap();
        out.write_u32::<LittleEndian>(self.dirty_rectangles_port)
            .unwrap();
        out.write_u32::<LittleEndian>(self.cursor_bitmap_port)
            .unwrap();
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        need(bytes, Self::WIRE_SIZE)?;
        let mut cur = Cursor::new(bytes);
        Ok(Self {
            key: cur.read_u32::<LittleEndian>().unwrap(),
            event_port: cur.read_u32::<LittleEndian>().unwrap(),
            framebuffer_port: cur.read_u32::<LittleEndian>().unwrap(),
            dirty_rectangles_port: cur.read_u32::<LittleEndian>().unwrap(),
            cursor_bitmap_port: cur.read_u32::<LittleEndian>().unwrap(),
        })
    }
}

/// Shared shape for `remove_display` and `display_no_longer_available`: both
/// carry only the display key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayKey {
    pub key: u32,
}

impl DisplayKey {
    pub const WIRE_SIZE: usize = 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.write_u32::<LittleEndian>(self.key).unwrap();
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        need(bytes, Self::WIRE_SIZE)?;
        let mut cur = Cursor::new(bytes);
        Ok(Self {
            key: cur.read_u32::<LittleEndian>().unwrap(),
        })
    }
}

/// Forces (or releases) legacy text mode on a display. The wire field is a
/// `u32` in the original; decoded here to a `bool` per the supplemented
/// "text mode is boolean, not enumerated" clarification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextMode {
    pub enabled: bool,
}

impl TextMode {
    pub const WIRE_SIZE: usize = 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.write_u32::<LittleEndian>(self.enabled as u32).unwrap();
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        need(bytes, Self::WIRE_SIZE)?;
        let mut cur = Cursor::new(bytes);
        let raw = cur.read_u32::<LittleEndian>().unwrap();
        Ok(Self { enabled: raw != 0 })
    }
}

/// Sent over a display's event channel when its resolution (or framebuffer
/// stride) changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetDisplay {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

impl SetDisplay {
    pub const WIRE_SIZE: usize = 4 * 3;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.write_u32::<LittleEndian>(self.width).unwrap();
        out.write_u32::<LittleEndian>(self.height).unwrap();
        out.write_u32::<LittleEndian>(self.stride).unwrap();
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        need(bytes, Self::WIRE_SIZE)?;
        let mut cur = Cursor::new(bytes);
        Ok(Self {
            width: cur.read_u32::<LittleEndian>().unwrap(),
            height: cur.read_u32::<LittleEndian>().unwrap(),
            stride: cur.read_u32::<LittleEndian>().unwrap(),
        })
    }
}

/// Notifies the consumer that the cursor bitmap in shared memory has changed
/// (or that its visibility/hotspot has changed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCursor {
    pub xhot: u32,
    pub yhot: u32,
    pub visible: bool,
}

impl UpdateCursor {
    pub const WIRE_SIZE: usize = 4 + 4 + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.write_u32::<LittleEndian>(self.xhot).unwrap();
        out.write_u32::<LittleEndian>(self.yhot).unwrap();
        out.write_u32::<LittleEndian>(self.visible as u32).unwrap();
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        need(bytes, Self::WIRE_SIZE)?;
        let mut cur = Cursor::new(bytes);
        let xhot = cur.read_u32::<LittleEndian>().unwrap();
        let yhot = cur.read_u32::<LittleEndian>().unwrap();
        let visible = cur.read_u32::<LittleEndian>().unwrap() != 0;
        Ok(Self {
            xhot,
            yhot,
            visible,
        })
    }
}

/// Moves the cursor to an absolute position within the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveCursor {
    pub x: i32,
    pub y: i32,
}

impl MoveCursor {
    pub const WIRE_SIZE: usize = 4 + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.write_i32::<LittleEndian>(self.x).unwrap();
        out.write_i32::<LittleEndian>(self.y).unwrap();
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        need(bytes, Self::WIRE_SIZE)?;
        let mut cur = Cursor::new(bytes);
        Ok(Self {
            x: cur.read_i32::<LittleEndian>().unwrap(),
            y: cur.read_i32::<LittleEndian>().unwrap(),
        })
    }
}

/// Reason a display was blanked. `blank_display(dpms, blank)` on the provider
/// side picks the variant from the `(dpms, blank)` pair per this exact mapping:
/// (true,true) → `DpmsSleep`; (true,false) → `DpmsWake`;
/// (false,true) → `ModesettingFillEnable`; (false,false) → `ModesettingFillDisable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankReason {
    DpmsSleep,
    DpmsWake,
    ModesettingFillEnable,
    ModesettingFillDisable,
}

impl BlankReason {
    /// Maps the `(dpms, blank)` pair the provider API takes to the reason code.
    pub fn from_dpms_blank(dpms: bool, blank: bool) -> Self {
        match (dpms, blank) {
            (true, true) => BlankReason::DpmsSleep,
            (true, false) => BlankReason::DpmsWake,
            (false, true) => BlankReason::ModesettingFillEnable,
            (false, false) => BlankReason::ModesettingFillDisable,
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            BlankReason::DpmsSleep => 0,
            BlankReason::DpmsWake => 1,
            BlankReason::ModesettingFillEnable => 2,
            BlankReason::ModesettingFillDisable => 3,
        }
    }

    fn from_wire(v: u32) -> Self {
        match v {
            1 => BlankReason::DpmsWake,
            2 => BlankReason::ModesettingFillEnable,
            3 => BlankReason::ModesettingFillDisable,
            _ => BlankReason::DpmsSleep,
        }
    }
}

/// Instructs the consumer to display a solid fill instead of the framebuffer.
/// `blank_display` always sends `color_argb = 0`; the field stays
/// general here since the wire payload carries an arbitrary color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlankDisplay {
    pub color_argb: u32,
    pub reason: BlankReason,
}

impl BlankDisplay {
    pub const WIRE_SIZE: usize = 4 + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.write_u32::<LittleEndian>(self.color_argb).unwrap();
        out.write_u32::<LittleEndian>(self.reason.to_wire()).unwrap();
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        need(bytes, Self::WIRE_SIZE)?;
        let mut cur = Cursor::new(bytes);
        let color_argb = cur.read_u32::<LittleEndian>().unwrap();
        let reason = BlankReason::from_wire(cur.read_u32::<LittleEndian>().unwrap());
        Ok(Self { color_argb, reason })
    }
}

/// Cursor bitmap geometry: always 64x64 ARGB8888.
pub const CURSOR_WIDTH: u32 = 64;
pub const CURSOR_HEIGHT: u32 = 64;
pub const CURSOR_STRIDE: u32 = CURSOR_WIDTH * 4;
pub const CURSOR_SIZE: usize = (CURSOR_STRIDE * CURSOR_HEIGHT) as usize;

/// One record on the dirty-rectangle channel. Unlike every other payload in
/// this module, this is never wrapped in a header/footer frame — the channel
/// is raw by design, so `encode`/`decode`
/// operate on exactly [`DirtyRect::WIRE_SIZE`] bytes with no framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DirtyRect {
    pub const WIRE_SIZE: usize = 4 * 4;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        {
            let mut cur = &mut out[..];
            cur.write_u32::<LittleEndian>(self.x).unwrap();
            cur.write_u32::<LittleEndian>(self.y).unwrap();
            cur.write_u32::<LittleEndian>(self.width).unwrap();
            cur.write_u32::<LittleEndian>(self.height).unwrap();
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        need(bytes, Self::WIRE_SIZE)?;
        let mut cur = Cursor::new(bytes);
        Ok(Self {
            x: cur.read_u32::<LittleEndian>().unwrap(),
            y: cur.read_u32::<LittleEndian>().unwrap(),
            width: cur.read_u32::<LittleEndian>().unwrap(),
            height: cur.read_u32::<LittleEndian>().unwrap(),
        })
    }
}
