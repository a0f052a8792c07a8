//! Consumer-side display backend: the four listening servers and accepted
//! channels that mirror a provider's [`pv_display_provider::display::Display`](../../pv-display-provider/src/display.rs),
//! plus the mapped local views of the framebuffer and cursor shared buffers.
//!
//! `create_pv_display_backend` builds an unconnected backend, `start_servers`
//! opens the four listeners, and as connections arrive each is bound
//! internally — there is no user-visible "finish" step on this side, unlike
//! the control session, since no per-connection authorization hook is needed
//! for these four channels.

use crate::error::SessionError;
use crate::fatal::{FatalErrorHandler, FatalLatch};
use log::warn;
use pv_display_protocol::{event, BlankDisplay, DirtyRect, MoveCursor, Reassembler, SetDisplay, UpdateCursor};
use pv_display_transport::{Client, ConnId, Transport};
use std::any::Any;
use std::sync::{Arc, Mutex};

pub type SetDisplayHandler = Arc<dyn Fn(SetDisplay) + Send + Sync>;
pub type UpdateCursorHandler = Arc<dyn Fn(UpdateCursor) + Send + Sync>;
pub type MoveCursorHandler = Arc<dyn Fn(MoveCursor) + Send + Sync>;
pub type BlankDisplayHandler = Arc<dyn Fn(BlankDisplay) + Send + Sync>;
pub type DirtyRectHandler = Arc<dyn Fn(DirtyRect) + Send + Sync>;

/// See `pv-display-provider::display::BufferView` — same technique, the
/// other local mapping of the same shared memory.
#[derive(Clone, Copy)]
struct BufferView {
    ptr: *const u8,
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

    fn as_slice(&self) -> &[u8] {
        // SAFETY: see `pv-display-provider::display::BufferView::as_mut_slice`;
        // the consumer's view is read-only by convention.
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }
}

#[derive(Default)]
struct Handlers {
    set_display: Option<SetDisplayHandler>,
    update_cursor: Option<UpdateCursorHandler>,
    move_cursor: Option<MoveCursorHandler>,
    blank_display: Option<BlankDisplayHandler>,
    dirty_rect: Option<DirtyRectHandler>,
    fatal_error: Option<FatalErrorHandler>,
}

#[derive(Default)]
struct Channels {
    event: Option<Box<dyn Client>>,
    framebuffer: Option<Box<dyn Client>>,
    dirty_rectangles: Option<Box<dyn Client>>,
    cursor: Option<Box<dyn Client>>,
}

struct State {
    channels: Channels,
    event_reassembler: Reassembler,
    framebuffer_view: Option<BufferView>,
    cursor_view: Option<BufferView>,
    servers: Vec<Box<dyn pv_display_transport::Server>>,
    driver_data: Option<Arc<dyn Any + Send + Sync>>,
}

struct Inner {
    key: u32,
    domain: u32,
    event_port: u32,
    framebuffer_port: u32,
    dirty_rectangles_port: u32,
    cursor_bitmap_port: u32,
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    handlers: Mutex<Handlers>,
    fatal: FatalLatch,
}

/// One display the consumer intends to accept from a provider.
#[derive(Clone)]
pub struct DisplayBackend {
    inner: Arc<Inner>,
}

impl DisplayBackend {
    /// Builds an unconnected backend for `key`; call [`DisplayBackend::start_servers`]
    /// to begin listening. `dirty_rectangles_port`/`cursor_bitmap_port` of
    /// `0` mean that optional channel was not requested.
    pub fn create_pv_display_backend(
        transport: Arc<dyn Transport>,
        domain: u32,
        key: u32,
        event_port: u32,
        framebuffer_port: u32,
        dirty_rectangles_port: u32,
        cursor_bitmap_port: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                key,
                domain,
                event_port,
                framebuffer_port,
                dirty_rectangles_port,
                cursor_bitmap_port,
                transport,
                state: Mutex::new(State {
                    channels: Channels::default(),
                    event_reassembler: Reassembler::new(),
                    framebuffer_view: None,
                    cursor_view: None,
                    servers: Vec::new(),
                    driver_data: None,
                }),
                handlers: Mutex::new(Handlers::default()),
                fatal: FatalLatch::new(),
            }),
        }
    }

    pub fn key(&self) -> u32 {
        self.inner.key
    }

    pub fn register_set_display_handler(&self, handler: Option<SetDisplayHandler>) {
        self.inner.handlers.lock().unwrap().set_display = handler;
    }

    pub fn register_update_cursor_handler(&self, handler: Option<UpdateCursorHandler>) {
        self.inner.handlers.lock().unwrap().update_cursor = handler;
    }

    pub fn register_move_cursor_handler(&self, handler: Option<MoveCursorHandler>) {
        self.inner.handlers.lock().unwrap().move_cursor = handler;
    }

    pub fn register_blank_display_handler(&self, handler: Option<BlankDisplayHandler>) {
        self.inner.handlers.lock().unwrap().blank_display = handler;
    }

    pub fn register_dirty_rect_handler(&self, handler: Option<DirtyRectHandler>) {
        self.inner.handlers.lock().unwrap().dirty_rect = handler;
    }

    pub fn register_fatal_error_handler(&self, handler: Option<FatalErrorHandler>) {
        self.inner.handlers.lock().unwrap().fatal_error = handler;
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

    fn fire_fatal(&self) {
        if self.inner.fatal.try_claim() {
            let handler = self.inner.handlers.lock().unwrap().fatal_error.clone();
            if let Some(h) = handler {
                h();
            }
        }
    }

    /// Opens the event and framebuffer listeners (required) plus
    /// dirty-rectangle and cursor listeners (only if their ports are
    /// nonzero). A second call reuses the `(domain, port)` slot rather than
    /// erroring, which is as close as this in-process transport comes to
    /// "reuse any existing listener on the same endpoint" for the simple
    /// single-listener case it models.
    pub fn start_servers(&self) -> Result<(), SessionError> {
        let mut servers = Vec::new();

        servers.push(self.listen_for(
            self.inner.event_port,
            {
                let backend = self.clone();
                Box::new(move |client| backend.finish_event_connection(client))
            },
        )?);

        servers.push(self.listen_for(
            self.inner.framebuffer_port,
            {
                let backend = self.clone();
                Box::new(move |client| backend.finish_framebuffer_connection(client))
            },
        )?);

        if self.inner.dirty_rectangles_port != 0 {
            servers.push(self.listen_for(
                self.inner.dirty_rectangles_port,
                {
                    let backend = self.clone();
                    Box::new(move |client| backend.finish_dirty_rectangle_connection(client))
                },
            )?);
        }

        if self.inner.cursor_bitmap_port != 0 {
            servers.push(self.listen_for(
                self.inner.cursor_bitmap_port,
                {
                    let backend = self.clone();
                    Box::new(move |client| backend.finish_cursor_connection(client))
                },
            )?);
        }

        self.inner.state.lock().unwrap().servers = servers;
        Ok(())
    }

    fn listen_for(
        &self,
        port: u32,
        on_connect: pv_display_transport::ConnectCallback,
    ) -> Result<Box<dyn pv_display_transport::Server>, SessionError> {
        Ok(self
            .inner
            .transport
            .listen(self.inner.domain, port, ConnId::ANY, on_connect)?)
    }

    fn wire_disconnect(&self, client: &dyn Client) {
        let backend = self.clone();
        client.register_callbacks(None, Some(Box::new(move || backend.fire_fatal())));
    }

    fn finish_framebuffer_connection(&self, client: Box<dyn Client>) {
        self.wire_disconnect(client.as_ref());
        let view = BufferView::from_client(client.as_ref());
        let mut state = self.inner.state.lock().unwrap();
        state.framebuffer_view = Some(view);
        state.channels.framebuffer = Some(client);
    }

    fn finish_cursor_connection(&self, client: Box<dyn Client>) {
        self.wire_disconnect(client.as_ref());
        let view = BufferView::from_client(client.as_ref());
        let mut state = self.inner.state.lock().unwrap();
        state.cursor_view = Some(view);
        state.channels.cursor = Some(client);
    }

    fn finish_event_connection(&self, client: Box<dyn Client>) {
        let on_disconnect = {
            let backend = self.clone();
            Box::new(move || backend.fire_fatal())
        };
        let on_data = {
            let backend = self.clone();
            Box::new(move || backend.on_event_data())
        };
        client.register_callbacks(Some(on_data), Some(on_disconnect));
        self.inner.state.lock().unwrap().channels.event = Some(client);
    }

    fn on_event_data(&self) {
        let result = {
            let mut state = self.inner.state.lock().unwrap();
            let channel = match state.channels.event.as_ref() {
                Some(c) => c,
                None => return,
            };
            pump(channel.as_ref(), &mut state.event_reassembler)
        };

        match result {
            Ok(packets) => {
                for packet in packets {
                    self.dispatch_event(packet);
                }
            }
            Err(e) => {
                warn!("display {} event channel protocol error: {e}", self.inner.key);
                self.fire_fatal();
            }
        }
    }

    fn dispatch_event(&self, packet: pv_display_protocol::Packet) {
        match packet.packet_type {
            event::SET_DISPLAY => match SetDisplay::decode(&packet.payload) {
                Ok(sd) => {
                    let h = self.inner.handlers.lock().unwrap().set_display.clone();
                    if let Some(h) = h {
                        h(sd);
                    }
                }
                Err(e) => warn!("malformed SET_DISPLAY: {e}"),
            },
            event::UPDATE_CURSOR => match UpdateCursor::decode(&packet.payload) {
                Ok(uc) => {
                    let h = self.inner.handlers.lock().unwrap().update_cursor.clone();
                    if let Some(h) = h {
                        h(uc);
                    }
                }
                Err(e) => warn!("malformed UPDATE_CURSOR: {e}"),
            },
            event::MOVE_CURSOR => match MoveCursor::decode(&packet.payload) {
                Ok(mc) => {
                    let h = self.inner.handlers.lock().unwrap().move_cursor.clone();
                    if let Some(h) = h {
                        h(mc);
                    }
                }
                Err(e) => warn!("malformed MOVE_CURSOR: {e}"),
            },
            event::BLANK_DISPLAY => match BlankDisplay::decode(&packet.payload) {
                Ok(bd) => {
                    let h = self.inner.handlers.lock().unwrap().blank_display.clone();
                    if let Some(h) = h {
                        h(bd);
                    }
                }
                Err(e) => warn!("malformed BLANK_DISPLAY: {e}"),
            },
            other => log::debug!("display {}: ignoring unknown event type {other}", self.inner.key),
        }
    }

    fn finish_dirty_rectangle_connection(&self, client: Box<dyn Client>) {
        self.wire_disconnect(client.as_ref());
        let on_data = {
            let backend = self.clone();
            Box::new(move || backend.on_dirty_rect_data())
        };
        client.register_callbacks(Some(on_data), None);
        self.inner.state.lock().unwrap().channels.dirty_rectangles = Some(client);
    }

    /// Raw 16-byte reads in a loop until fewer than 16 bytes remain: this
    /// channel carries no header/footer framing.
    fn on_dirty_rect_data(&self) {
        let rects = {
            let state = self.inner.state.lock().unwrap();
            let channel = match state.channels.dirty_rectangles.as_ref() {
                Some(c) => c,
                None => return,
            };
            let mut rects = Vec::new();
            loop {
                let avail = match channel.available_data() {
                    Ok(n) => n,
                    Err(_) => break,
                };
                if avail < DirtyRect::WIRE_SIZE {
                    break;
                }
                let mut buf = [0u8; DirtyRect::WIRE_SIZE];
                if channel.recv(&mut buf).is_err() {
                    break;
                }
                match DirtyRect::decode(&buf) {
                    Ok(r) => rects.push(r),
                    Err(e) => {
                        warn!("malformed dirty-rectangle record: {e}");
                        break;
                    }
                }
            }
            rects
        };

        let handler = self.inner.handlers.lock().unwrap().dirty_rect.clone();
        if let Some(h) = handler {
            for r in rects {
                h(r);
            }
        }
    }

    /// Copies out the current framebuffer contents, or `None` if the
    /// framebuffer channel hasn't connected yet.
    pub fn read_framebuffer(&self) -> Option<Vec<u8>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .framebuffer_view
            .map(|v| v.as_slice().to_vec())
    }

    /// Copies out the current cursor bitmap, or `None` if no cursor channel
    /// was requested or it hasn't connected yet.
    pub fn read_cursor(&self) -> Option<Vec<u8>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .cursor_view
            .map(|v| v.as_slice().to_vec())
    }

    /// Full teardown: disconnects whichever channels are connected and
    /// closes all four listening servers.
    pub fn destroy(&self) {
        let (channels, servers) = {
            let mut state = self.inner.state.lock().unwrap();
            let channels: Vec<_> = [
                state.channels.event.take(),
                state.channels.framebuffer.take(),
                state.channels.dirty_rectangles.take(),
                state.channels.cursor.take(),
            ]
            .into_iter()
            .flatten()
            .collect();
            let servers: Vec<_> = state.servers.drain(..).collect();
            (channels, servers)
        };
        for channel in channels {
            channel.disconnect();
        }
        for server in servers {
            server.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pv_display_protocol::{encode, BlankReason};
    use pv_display_transport::MemTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const DOMAIN: u32 = 4;

    fn new_backend(transport: Arc<dyn Transport>) -> DisplayBackend {
        DisplayBackend::create_pv_display_backend(transport, DOMAIN, 1, 2001, 2000, 2002, 2003)
    }

    fn connect_all(transport: &Arc<dyn Transport>) -> (Box<dyn Client>, Box<dyn Client>, Box<dyn Client>, Box<dyn Client>) {
        let event = transport.connect(DOMAIN, 2001, 4, ConnId::ANY).unwrap();
        let fb = transport.connect(DOMAIN, 2000, 2, ConnId::ANY).unwrap();
        let dr = transport.connect(DOMAIN, 2002, 32, ConnId::ANY).unwrap();
        let cur = transport.connect(DOMAIN, 2003, 5, ConnId::ANY).unwrap();
        (event, fb, dr, cur)
    }

    fn wait_until(mut pred: impl FnMut() -> bool) {
        for _ in 0..200 {
            if pred() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn start_servers_opens_all_four_listeners_when_all_ports_set() {
        let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
        let backend = new_backend(transport.clone());
        backend.start_servers().unwrap();

        let (_event, fb, _dr, _cur) = connect_all(&transport);
        wait_until(|| backend.read_framebuffer().is_some());
        assert!(backend.read_framebuffer().is_some());
        let _ = fb;
    }

    #[test]
    fn start_servers_skips_optional_listeners_when_ports_are_zero() {
        let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
        let backend = DisplayBackend::create_pv_display_backend(transport.clone(), DOMAIN, 1, 2001, 2000, 0, 0);
        backend.start_servers().unwrap();

        // No listener on the dirty-rectangles port, so connecting there fails.
        assert!(transport.connect(DOMAIN, 2002, 32, ConnId::ANY).is_err());
        assert!(transport.connect(DOMAIN, 2003, 5, ConnId::ANY).is_err());
    }

    #[test]
    fn framebuffer_connection_binds_a_readable_view() {
        let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
        let backend = new_backend(transport.clone());
        backend.start_servers().unwrap();
        let (_event, fb, _dr, _cur) = connect_all(&transport);

        wait_until(|| backend.read_framebuffer().is_some());
        let contents = backend.read_framebuffer().unwrap();
        assert_eq!(contents.len(), fb.buffer_size());
    }

    #[test]
    fn event_dispatch_decodes_all_four_event_types_with_expected_values() {
        let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
        let backend = new_backend(transport.clone());

        let set_display_seen = Arc::new(Mutex::new(None));
        let update_cursor_seen = Arc::new(Mutex::new(None));
        let move_cursor_seen = Arc::new(Mutex::new(None));
        let blank_seen = Arc::new(Mutex::new(None));

        backend.register_set_display_handler(Some(Arc::new({
            let seen = set_display_seen.clone();
            move |sd| *seen.lock().unwrap() = Some(sd)
        })));
        backend.register_update_cursor_handler(Some(Arc::new({
            let seen = update_cursor_seen.clone();
            move |uc| *seen.lock().unwrap() = Some(uc)
        })));
        backend.register_move_cursor_handler(Some(Arc::new({
            let seen = move_cursor_seen.clone();
            move |mc| *seen.lock().unwrap() = Some(mc)
        })));
        backend.register_blank_display_handler(Some(Arc::new({
            let seen = blank_seen.clone();
            move |bd| *seen.lock().unwrap() = Some(bd)
        })));

        backend.start_servers().unwrap();
        let (event, _fb, _dr, _cur) = connect_all(&transport);

        let set_display = SetDisplay {
            width: 1920,
            height: 1080,
            stride: 7680,
        };
        event.send(&encode(event::SET_DISPLAY, &set_display.encode()).unwrap()).unwrap();

        let update_cursor = UpdateCursor {
            xhot: 3,
            yhot: 4,
            visible: true,
        };
        event.send(&encode(event::UPDATE_CURSOR, &update_cursor.encode()).unwrap()).unwrap();

        let move_cursor = MoveCursor { x: -7, y: 12 };
        event.send(&encode(event::MOVE_CURSOR, &move_cursor.encode()).unwrap()).unwrap();

        let blank = BlankDisplay {
            color_argb: 0,
            reason: BlankReason::DpmsSleep,
        };
        event.send(&encode(event::BLANK_DISPLAY, &blank.encode()).unwrap()).unwrap();

        wait_until(|| blank_seen.lock().unwrap().is_some());
        assert_eq!(*set_display_seen.lock().unwrap(), Some(set_display));
        assert_eq!(*update_cursor_seen.lock().unwrap(), Some(update_cursor));
        assert_eq!(*move_cursor_seen.lock().unwrap(), Some(move_cursor));
        assert_eq!(*blank_seen.lock().unwrap(), Some(blank));
    }

    #[test]
    fn malformed_event_payload_is_logged_and_does_not_call_handler() {
        let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
        let backend = new_backend(transport.clone());

        let called = Arc::new(AtomicUsize::new(0));
        backend.register_set_display_handler(Some(Arc::new({
            let called = called.clone();
            move |_| {
                called.fetch_add(1, Ordering::SeqCst);
            }
        })));

        backend.start_servers().unwrap();
        let (event, _fb, _dr, _cur) = connect_all(&transport);

        // Too short to decode as SET_DISPLAY (needs 12 bytes).
        event.send(&encode(event::SET_DISPLAY, b"ab").unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(called.load(Ordering::SeqCst), 0);

        // The channel is still usable afterward.
        event
            .send(&encode(event::SET_DISPLAY, &SetDisplay { width: 1, height: 1, stride: 4 }.encode()).unwrap())
            .unwrap();
        wait_until(|| called.load(Ordering::SeqCst) == 1);
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dirty_rect_reader_drains_multiple_raw_records_in_one_wakeup() {
        let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
        let backend = new_backend(transport.clone());

        let received = Arc::new(Mutex::new(Vec::new()));
        backend.register_dirty_rect_handler(Some(Arc::new({
            let received = received.clone();
            move |r| received.lock().unwrap().push(r)
        })));

        backend.start_servers().unwrap();
        let (_event, _fb, dr, _cur) = connect_all(&transport);

        let a = DirtyRect { x: 0, y: 0, width: 10, height: 10 };
        let b = DirtyRect { x: 10, y: 10, width: 20, height: 20 };
        // Raw, unframed: back-to-back 16-byte records with no header/footer.
        dr.send(&a.encode()).unwrap();
        dr.send(&b.encode()).unwrap();

        wait_until(|| received.lock().unwrap().len() == 2);
        let got = received.lock().unwrap().clone();
        assert_eq!(got, vec![a, b]);
    }

    #[test]
    fn fatal_handler_fires_once_across_multiple_channel_disconnects() {
        let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
        let backend = new_backend(transport.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        backend.register_fatal_error_handler(Some(Arc::new({
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        })));

        backend.start_servers().unwrap();
        let (event, fb, dr, cur) = connect_all(&transport);

        event.disconnect();
        fb.disconnect();
        dr.disconnect();
        cur.disconnect();

        wait_until(|| fired.load(Ordering::SeqCst) >= 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_disconnects_channels_and_closes_servers() {
        let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
        let backend = new_backend(transport.clone());
        backend.start_servers().unwrap();
        let (event, _fb, _dr, _cur) = connect_all(&transport);

        let disconnected = Arc::new(AtomicUsize::new(0));
        let flag = disconnected.clone();
        event.register_callbacks(None, Some(Box::new(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        })));

        backend.destroy();
        wait_until(|| disconnected.load(Ordering::SeqCst) >= 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);

        // Listeners were closed: a fresh connect attempt fails.
        assert!(transport.connect(DOMAIN, 2001, 4, ConnId::ANY).is_err());
    }
}

fn pump(channel: &dyn Client, reassembler: &mut Reassembler) -> Result<Vec<pv_display_protocol::Packet>, SessionError> {
    let mut packets = Vec::new();
    loop {
        let avail = channel.available_data()?;
        if avail == 0 {
            break;
        }
        let mut buf = vec![0u8; avail];
        channel.recv(&mut buf)?;
        reassembler.push(&buf);
        loop {
            match reassembler.poll() {
                Ok(Some(p)) => packets.push(p),
                Ok(None) => break,
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(packets)
}
