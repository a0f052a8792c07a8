//! Consumer-side control session: listens for the provider's control
//! connection and dispatches `DRIVER_CAPABILITIES`, `ADVERTISED_DISPLAY_LIST`,
//! `DISPLAY_NO_LONGER_AVAILABLE` and `TEXT_MODE` to registered handlers.
//!
//! Inbound connects are forwarded to the user's `control_connection` handler,
//! which is expected to call [`ControlSession::finish_control_connection`]
//! to bind reassembly.

use crate::error::SessionError;
use crate::fatal::{FatalErrorHandler, FatalLatch};
use log::{debug, warn};
use pv_display_protocol::{
    control, encode, AddDisplay, DisplayInfo, DisplayKey, DisplayList, DriverCapabilities, Packet,
    Reassembler, TextMode,
};
use pv_display_transport::{Client, ConnId, ConnectCallback, Server, Transport};
use std::sync::{Arc, Mutex};

pub type DriverCapabilitiesHandler = Arc<dyn Fn(DriverCapabilities) + Send + Sync>;
pub type AdvertisedDisplayListHandler = Arc<dyn Fn(&[DisplayInfo]) + Send + Sync>;
pub type DisplayNoLongerAvailableHandler = Arc<dyn Fn(u32) + Send + Sync>;
pub type TextModeHandler = Arc<dyn Fn(bool) + Send + Sync>;
pub type ControlConnectionHandler = Arc<dyn Fn(Box<dyn Client>) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    control_connection: Option<ControlConnectionHandler>,
    driver_capabilities: Option<DriverCapabilitiesHandler>,
    advertised_display_list: Option<AdvertisedDisplayListHandler>,
    display_no_longer_available: Option<DisplayNoLongerAvailableHandler>,
    text_mode: Option<TextModeHandler>,
    fatal_error: Option<FatalErrorHandler>,
}

struct ConnectedState {
    channel: Box<dyn Client>,
    reassembler: Reassembler,
}

struct Inner {
    domain: u32,
    control_port: u32,
    transport: Arc<dyn Transport>,
    server: Mutex<Option<Box<dyn Server>>>,
    state: Mutex<Option<ConnectedState>>,
    handlers: Mutex<Handlers>,
    fatal: FatalLatch,
}

/// One consumer-side control session, listening for a single provider's
/// control connection.
#[derive(Clone)]
pub struct ControlSession {
    inner: Arc<Inner>,
}

fn pump(channel: &dyn Client, reassembler: &mut Reassembler) -> Result<Vec<Packet>, SessionError> {
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

impl ControlSession {
    /// Starts listening on `(domain, control_port)`. Inbound connects are
    /// forwarded to whatever `control_connection` handler is registered at
    /// connect time; with none registered, the connection is logged and
    /// dropped.
    pub fn create_consumer(
        transport: Arc<dyn Transport>,
        domain: u32,
        control_port: u32,
    ) -> Result<Self, SessionError> {
        let inner = Arc::new(Inner {
            domain,
            control_port,
            transport: transport.clone(),
            server: Mutex::new(None),
            state: Mutex::new(None),
            handlers: Mutex::new(Handlers::default()),
            fatal: FatalLatch::new(),
        });

        let session = Self { inner };
        let on_connect: ConnectCallback = {
            let session = session.clone();
            Box::new(move |client| session.on_control_connect(client))
        };
        let server = transport.listen(domain, control_port, ConnId::ANY, on_connect)?;
        *session.inner.server.lock().unwrap() = Some(server);
        Ok(session)
    }

    fn on_control_connect(&self, client: Box<dyn Client>) {
        let handler = self.inner.handlers.lock().unwrap().control_connection.clone();
        match handler {
            Some(h) => h(client),
            None => {
                warn!("control connection arrived with no control_connection handler registered");
                client.disconnect();
            }
        }
    }

    /// Binds reassembly and callbacks to a control client handed to the
    /// `control_connection` handler.
    pub fn finish_control_connection(&self, client: Box<dyn Client>) {
        let on_data = {
            let session = self.clone();
            Box::new(move || session.on_control_data())
        };
        let on_disconnect = {
            let session = self.clone();
            Box::new(move || session.fire_fatal())
        };
        client.register_callbacks(Some(on_data), Some(on_disconnect));
        *self.inner.state.lock().unwrap() = Some(ConnectedState {
            channel: client,
            reassembler: Reassembler::new(),
        });
    }

    fn on_control_data(&self) {
        let result = {
            let mut guard = self.inner.state.lock().unwrap();
            match guard.as_mut() {
                Some(state) => pump(state.channel.as_ref(), &mut state.reassembler),
                None => return,
            }
        };

        match result {
            Ok(packets) => {
                for packet in packets {
                    self.dispatch(packet);
                }
            }
            Err(e) => {
                warn!("consumer control session protocol error: {e}");
                self.fire_fatal();
            }
        }
    }

    fn dispatch(&self, packet: Packet) {
        match packet.packet_type {
            control::DRIVER_CAPABILITIES => match DriverCapabilities::decode(&packet.payload) {
                Ok(caps) => {
                    let h = self.inner.handlers.lock().unwrap().driver_capabilities.clone();
                    if let Some(h) = h {
                        h(caps);
                    }
                }
                Err(e) => warn!("malformed DRIVER_CAPABILITIES: {e}"),
            },
            control::ADVERTISED_DISPLAY_LIST => match DisplayList::decode(&packet.payload) {
                Ok(list) => {
                    let h = self
                        .inner
                        .handlers
                        .lock()
                        .unwrap()
                        .advertised_display_list
                        .clone();
                    if let Some(h) = h {
                        h(&list.displays);
                    }
                }
                Err(e) => warn!("malformed ADVERTISED_DISPLAY_LIST: {e}"),
            },
            control::DISPLAY_NO_LONGER_AVAILABLE => match DisplayKey::decode(&packet.payload) {
                Ok(k) => {
                    let h = self
                        .inner
                        .handlers
                        .lock()
                        .unwrap()
                        .display_no_longer_available
                        .clone();
                    if let Some(h) = h {
                        h(k.key);
                    }
                }
                Err(e) => warn!("malformed DISPLAY_NO_LONGER_AVAILABLE: {e}"),
            },
            control::TEXT_MODE => match TextMode::decode(&packet.payload) {
                Ok(tm) => {
                    let h = self.inner.handlers.lock().unwrap().text_mode.clone();
                    if let Some(h) = h {
                        h(tm.enabled);
                    }
                }
                Err(e) => warn!("malformed TEXT_MODE: {e}"),
            },
            other => debug!("consumer control session: ignoring unknown packet type {other}"),
        }
    }

    fn fire_fatal(&self) {
        if self.inner.fatal.try_claim() {
            let handler = self.inner.handlers.lock().unwrap().fatal_error.clone();
            if let Some(h) = handler {
                h();
            }
        }
    }

    pub fn register_control_connection_handler(&self, handler: Option<ControlConnectionHandler>) {
        self.inner.handlers.lock().unwrap().control_connection = handler;
    }

    pub fn register_driver_capabilities_handler(&self, handler: Option<DriverCapabilitiesHandler>) {
        self.inner.handlers.lock().unwrap().driver_capabilities = handler;
    }

    pub fn register_advertised_display_list_handler(
        &self,
        handler: Option<AdvertisedDisplayListHandler>,
    ) {
        self.inner.handlers.lock().unwrap().advertised_display_list = handler;
    }

    pub fn register_display_no_longer_available_handler(
        &self,
        handler: Option<DisplayNoLongerAvailableHandler>,
    ) {
        self.inner.handlers.lock().unwrap().display_no_longer_available = handler;
    }

    pub fn register_text_mode_handler(&self, handler: Option<TextModeHandler>) {
        self.inner.handlers.lock().unwrap().text_mode = handler;
    }

    pub fn register_fatal_error_handler(&self, handler: Option<FatalErrorHandler>) {
        self.inner.handlers.lock().unwrap().fatal_error = handler;
    }

    fn send_control(&self, packet_type: u32, payload: &[u8]) -> Result<(), SessionError> {
        let frame = encode(packet_type, payload)?;
        let guard = self.inner.state.lock().unwrap();
        let state = guard.as_ref().ok_or(SessionError::NotFound)?;
        state.channel.send(&frame)?;
        state.channel.notify_remote();
        Ok(())
    }

    /// Sends `HOST_DISPLAY_LIST`, the hint of displays the host would like
    /// the provider to handle.
    pub fn display_list(&self, infos: &[DisplayInfo]) -> Result<(), SessionError> {
        let list = DisplayList {
            displays: infos.to_vec(),
        };
        self.send_control(control::HOST_DISPLAY_LIST, &list.encode())
    }

    /// Sends `ADD_DISPLAY`, requesting the provider bring up `key` on the
    /// four given ports (`dirty_rectangles_port`/`cursor_bitmap_port` may be
    /// `0` to decline those optional channels).
    pub fn add_display(
        &self,
        key: u32,
        event_port: u32,
        framebuffer_port: u32,
        dirty_rectangles_port: u32,
        cursor_bitmap_port: u32,
    ) -> Result<(), SessionError> {
        let req = AddDisplay {
            key,
            event_port,
            framebuffer_port,
            dirty_rectangles_port,
            cursor_bitmap_port,
        };
        self.send_control(control::ADD_DISPLAY, &req.encode())
    }

    /// Sends `REMOVE_DISPLAY`, e.g. on host-side physical unplug.
    pub fn remove_display(&self, key: u32) -> Result<(), SessionError> {
        self.send_control(control::REMOVE_DISPLAY, &DisplayKey { key }.encode())
    }

    /// Disconnects the control channel (if connected) and stops listening.
    pub fn destroy(&self) {
        let mut guard = self.inner.state.lock().unwrap();
        let taken = guard.take();
        drop(guard);
        if let Some(state) = taken {
            state.channel.disconnect();
        }

        let mut guard = self.inner.server.lock().unwrap();
        let taken = guard.take();
        drop(guard);
        if let Some(server) = taken {
            server.close();
        }
    }

    pub fn domain(&self) -> u32 {
        self.inner.domain
    }

    pub fn control_port(&self) -> u32 {
        self.inner.control_port
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }
}
