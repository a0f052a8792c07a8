//! Provider-side per-display session: the four owned channels
//! (framebuffer, event, optional dirty-rectangle, optional cursor), the
//! mapped framebuffer and cursor local buffers, and the operations hung off
//! a single display handle.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::fatal::{FatalErrorHandler, FatalLatch};
use log::{trace, warn};
use pv_display_protocol::{
    encode, event, AddDisplay, BlankDisplay, BlankReason, DirtyRect, MoveCursor, SetDisplay,
    UpdateCursor, CURSOR_HEIGHT, CURSOR_SIZE, CURSOR_STRIDE, CURSOR_WIDTH,
};
use pv_display_transport::{Client, ConnId, Transport};
use std::any::Any;
use std::sync::{Arc, Mutex};

/// A raw pointer into a channel's shared local buffer. The buffer is owned by
/// the transport client for the client's lifetime; this
/// newtype just gives that pointer a `Send + Sync` home, the same technique
/// `pv-display-transport::mem::SharedBuffer` uses for the loopback buffer.
#[derive(Clone, Copy)]
struct BufferView {
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for BufferView {}
unsafe impl Sync for BufferView {}

impl BufferView {
    fn from_client(client: &dyn Client) -> Self {
        Self {
            ptr: client.local_buffer(),
            size: client.buffer_size(),
        }
    }

    fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: the transport guarantees this pointer is valid and stable
        // for the client's lifetime, and sized at least `self.size` bytes
        //. The provider is the sole local writer; the consumer's
        // view is a separate mapping over the same shared memory.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

struct Channels {
    framebuffer: Option<Box<dyn Client>>,
    event: Option<Box<dyn Client>>,
    dirty_rectangles: Option<Box<dyn Client>>,
    cursor: Option<Box<dyn Client>>,
}

struct State {
    width: u32,
    height: u32,
    stride: u32,
    channels: Channels,
    framebuffer_view: Option<BufferView>,
    cursor_view: Option<BufferView>,
    cursor_hotspot: (u32, u32),
    cursor_visible: bool,
    driver_data: Option<Arc<dyn Any + Send + Sync>>,
}

struct Inner {
    key: u32,
    transport: Arc<dyn Transport>,
    domain: u32,
    state: Mutex<State>,
    fatal: FatalLatch,
    fatal_handler: Mutex<Option<FatalErrorHandler>>,
}

/// A single active display on the provider side. Cheaply `Clone`-able (an
/// `Arc` handle); every method takes `&self` and internally serializes on the
/// display's own lock.
#[derive(Clone)]
pub struct Display {
    inner: Arc<Inner>,
}

fn connect_channel(
    transport: &Arc<dyn Transport>,
    domain: u32,
    port: u32,
    pages: u32,
) -> Result<Box<dyn Client>, SessionError> {
    Ok(transport.connect(domain, port, pages, ConnId::ANY)?)
}

impl Display {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        transport: Arc<dyn Transport>,
        domain: u32,
        config: &SessionConfig,
        add_request: AddDisplay,
        width: u32,
        height: u32,
        stride: u32,
        initial_contents: Option<&[u8]>,
    ) -> Result<Self, SessionError> {
        let fb_size = (stride as usize) * (height as usize);
        let fb_pages = crate::config::pages_for(fb_size as u32);

        // Open channels in order (framebuffer, event, dirty-rect, cursor);
        // on any failure, disconnect whatever already opened and propagate
        // the first error.
        let framebuffer = connect_channel(&transport, domain, add_request.framebuffer_port, fb_pages)?;

        let event = match connect_channel(&transport, domain, add_request.event_port, config.rings.event)
        {
            Ok(c) => c,
            Err(e) => {
                framebuffer.disconnect();
                return Err(e);
            }
        };

        let dirty_rectangles = if add_request.dirty_rectangles_port != 0 {
            match connect_channel(
                &transport,
                domain,
                add_request.dirty_rectangles_port,
                config.rings.dirty_rectangles,
            ) {
                Ok(c) => Some(c),
                Err(e) => {
                    framebuffer.disconnect();
                    event.disconnect();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let cursor = if add_request.cursor_bitmap_port != 0 {
            match connect_channel(
                &transport,
                domain,
                add_request.cursor_bitmap_port,
                config.rings.cursor,
            ) {
                Ok(c) => Some(c),
                Err(e) => {
                    framebuffer.disconnect();
                    event.disconnect();
                    if let Some(dr) = &dirty_rectangles {
                        dr.disconnect();
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        let framebuffer_view = BufferView::from_client(framebuffer.as_ref());
        if let Some(contents) = initial_contents {
            let dst = framebuffer_view.as_mut_slice();
            let n = contents.len().min(dst.len());
            dst[..n].copy_from_slice(&contents[..n]);
        }

        let cursor_view = cursor.as_ref().map(|c| BufferView::from_client(c.as_ref()));

        let inner = Arc::new(Inner {
            key: add_request.key,
            transport,
            domain,
            state: Mutex::new(State {
                width,
                height,
                stride,
                channels: Channels {
                    framebuffer: Some(framebuffer),
                    event: Some(event),
                    dirty_rectangles,
                    cursor,
                },
                framebuffer_view: Some(framebuffer_view),
                cursor_view,
                cursor_hotspot: (0, 0),
                cursor_visible: false,
                driver_data: None,
            }),
            fatal: FatalLatch::new(),
            fatal_handler: Mutex::new(None),
        });

        let display = Self { inner };
        display.wire_disconnect_handlers();
        Ok(display)
    }

    fn wire_disconnect_handlers(&self) {
        let state = self.inner.state.lock().unwrap();
        for channel in [
            state.channels.framebuffer.as_ref(),
            state.channels.event.as_ref(),
            state.channels.dirty_rectangles.as_ref(),
            state.channels.cursor.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            let display = self.clone();
            channel.register_callbacks(None, Some(Box::new(move || display.fire_fatal())));
        }
    }

    fn fire_fatal(&self) {
        if self.inner.fatal.try_claim() {
            let handler = self.inner.fatal_handler.lock().unwrap().clone();
            if let Some(h) = handler {
                h();
            }
        }
    }

    pub fn register_fatal_error_handler(&self, handler: Option<FatalErrorHandler>) {
        *self.inner.fatal_handler.lock().unwrap() = handler;
    }

    pub fn key(&self) -> u32 {
        self.inner.key
    }

    pub fn set_driver_data<T: Any + Send + Sync + 'static>(&self, data: T) {
        self.inner.state.lock().unwrap().driver_data = Some(Arc::new(data));
    }

    pub fn driver_data<T: Any + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .driver_data
            .clone()
            .and_then(|d| d.downcast::<T>().ok())
    }

    pub fn dimensions(&self) -> (u32, u32, u32) {
        let s = self.inner.state.lock().unwrap();
        (s.width, s.height, s.stride)
    }

    pub fn supports_cursor(&self) -> bool {
        self.inner.state.lock().unwrap().cursor_view.is_some()
    }

    fn send_event(state: &State, packet_type: u32, payload: &[u8]) -> Result<(), SessionError> {
        let channel = state
            .channels
            .event
            .as_ref()
            .ok_or(SessionError::NotFound)?;
        let frame = encode(packet_type, payload)?;
        channel.send(&frame)?;
        channel.notify_remote();
        Ok(())
    }

    /// Updates the stored dimensions and notifies the consumer with
    /// `SET_DISPLAY`.
    pub fn change_resolution(&self, width: u32, height: u32, stride: u32) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock().unwrap();
        state.width = width;
        state.height = height;
        state.stride = stride;
        Self::send_event(
            &state,
            event::SET_DISPLAY,
            &SetDisplay {
                width,
                height,
                stride,
            }
            .encode(),
        )
    }

    /// Writes a 16-byte raw dirty-rectangle record, with an overrun
    /// fallback: `space < 16` yields [`SessionError::TryAgain`] with nothing
    /// written; `16 <= space < 32` replaces the caller's rectangle with the
    /// full display bounds to avoid starving the consumer.
    pub fn invalidate_region(&self, x: u32, y: u32, width: u32, height: u32) -> Result<(), SessionError> {
        let state = self.inner.state.lock().unwrap();
        let channel = state
            .channels
            .dirty_rectangles
            .as_ref()
            .ok_or(SessionError::NotFound)?;

        let space = channel.available_space()?;
        if space < DirtyRect::WIRE_SIZE {
            return Err(SessionError::TryAgain);
        }

        let rect = if space < 2 * DirtyRect::WIRE_SIZE {
            DirtyRect {
                x: 0,
                y: 0,
                width: state.width,
                height: state.height,
            }
        } else {
            DirtyRect {
                x,
                y,
                width,
                height,
            }
        };

        channel.send(&rect.encode())?;
        channel.notify_remote();
        Ok(())
    }

    /// Copies `src` (tightly packed ARGB8888, `src_w * src_h * 4` bytes) into
    /// the fixed 64x64 destination, zero-filling rows/columns beyond the
    /// source dimensions, then signals `UPDATE_CURSOR`.
    pub fn load_cursor_image(&self, src: &[u8], src_w: u8, src_h: u8) -> Result<(), SessionError> {
        if src_w as u32 > CURSOR_WIDTH || src_h as u32 > CURSOR_HEIGHT {
            return Err(SessionError::InvalidArgument(
                "cursor source dimensions exceed 64x64".into(),
            ));
        }

        let state = self.inner.state.lock().unwrap();
        let view = state.cursor_view.ok_or(SessionError::NotFound)?;
        let dst = view.as_mut_slice();
        debug_assert!(dst.len() >= CURSOR_SIZE);

        let src_row_bytes = src_w as usize * 4;
        for row in 0..CURSOR_HEIGHT as usize {
            let dst_row = &mut dst[row * CURSOR_STRIDE as usize..(row + 1) * CURSOR_STRIDE as usize];
            if row < src_h as usize {
                let src_row = &src[row * src_row_bytes..(row + 1) * src_row_bytes];
                dst_row[..src_row_bytes].copy_from_slice(src_row);
                dst_row[src_row_bytes..].fill(0);
            } else {
                dst_row.fill(0);
            }
        }

        Self::send_event(
            &state,
            event::UPDATE_CURSOR,
            &UpdateCursor {
                xhot: state.cursor_hotspot.0,
                yhot: state.cursor_hotspot.1,
                visible: state.cursor_visible,
            }
            .encode(),
        )
    }

    pub fn set_cursor_hotspot(&self, xh: u32, yh: u32) -> Result<(), SessionError> {
        if xh > CURSOR_WIDTH || yh > CURSOR_HEIGHT {
            return Err(SessionError::InvalidArgument(
                "cursor hotspot out of bounds".into(),
            ));
        }
        let mut state = self.inner.state.lock().unwrap();
        state.cursor_hotspot = (xh, yh);
        Self::send_event(
            &state,
            event::UPDATE_CURSOR,
            &UpdateCursor {
                xhot: xh,
                yhot: yh,
                visible: state.cursor_visible,
            }
            .encode(),
        )
    }

    pub fn set_cursor_visibility(&self, visible: bool) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock().unwrap();
        state.cursor_visible = visible;
        Self::send_event(
            &state,
            event::UPDATE_CURSOR,
            &UpdateCursor {
                xhot: state.cursor_hotspot.0,
                yhot: state.cursor_hotspot.1,
                visible,
            }
            .encode(),
        )
    }

    /// Sends `MOVE_CURSOR` with coordinates absolute to this display's
    /// framebuffer.
    pub fn move_cursor(&self, x: i32, y: i32) -> Result<(), SessionError> {
        let state = self.inner.state.lock().unwrap();
        Self::send_event(&state, event::MOVE_CURSOR, &MoveCursor { x, y }.encode())
    }

    pub fn blank_display(&self, dpms: bool, blank: bool) -> Result<(), SessionError> {
        let state = self.inner.state.lock().unwrap();
        Self::send_event(
            &state,
            event::BLANK_DISPLAY,
            &BlankDisplay {
                color_argb: 0,
                reason: BlankReason::from_dpms_blank(dpms, blank),
            }
            .encode(),
        )
    }

    pub fn dpms_sleep(&self) -> Result<(), SessionError> {
        self.blank_display(true, true)
    }

    pub fn dpms_wake(&self) -> Result<(), SessionError> {
        self.blank_display(true, false)
    }

    pub fn modesetting_fill(&self, enable: bool) -> Result<(), SessionError> {
        self.blank_display(false, enable)
    }

    /// Re-establishes the display's channels against `add_request`'s ports,
    /// without re-allocating the framebuffer or cursor local buffers.
    /// Framebuffer/event failures are fatal; dirty-rect/cursor failures
    /// (including a `0` port, meaning "not requested this time") are logged
    /// and tolerated.
    pub fn reconnect(&self, add_request: AddDisplay, domain: u32) -> Result<(), SessionError> {
        if add_request.framebuffer_port == 0 || add_request.event_port == 0 {
            return Err(SessionError::InvalidArgument(
                "reconnect requires nonzero framebuffer_port and event_port".into(),
            ));
        }

        let state = self.inner.state.lock().unwrap();
        {
            let fb = state.channels.framebuffer.as_ref().ok_or(SessionError::NotFound)?;
            fb.reconnect(domain, add_request.framebuffer_port)?;
        }
        {
            let ev = state.channels.event.as_ref().ok_or(SessionError::NotFound)?;
            ev.reconnect(domain, add_request.event_port)?;
        }
        if add_request.dirty_rectangles_port != 0 {
            if let Some(dr) = &state.channels.dirty_rectangles {
                if let Err(e) = dr.reconnect(domain, add_request.dirty_rectangles_port) {
                    warn!("dirty-rectangle channel reconnect failed (tolerated): {e}");
                }
            }
        }
        if add_request.cursor_bitmap_port != 0 {
            if let Some(cur) = &state.channels.cursor {
                if let Err(e) = cur.reconnect(domain, add_request.cursor_bitmap_port) {
                    warn!("cursor channel reconnect failed (tolerated): {e}");
                }
            }
        }
        trace!("display {} reconnected to domain {domain}", self.inner.key);
        Ok(())
    }

    pub fn domain(&self) -> u32 {
        self.inner.domain
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Disconnects whichever of the four channels are still present and
    /// drops them; safe to call more than once (subsequent operations on a
    /// display with no framebuffer/event channel return
    /// [`SessionError::NotFound`]).
    pub fn destroy(&self) {
        let channels: Vec<_> = {
            let mut state = self.inner.state.lock().unwrap();
            [
                state.channels.framebuffer.take(),
                state.channels.event.take(),
                state.channels.dirty_rectangles.take(),
                state.channels.cursor.take(),
            ]
            .into_iter()
            .flatten()
            .collect()
        };
        for channel in channels {
            channel.disconnect();
        }
        trace!("display {} destroyed", self.inner.key);
    }
}
