//! Drives the dedicated single-display provider through a full negotiation
//! against a minimal hand-rolled host stand-in, over
//! [`pv_display_transport::MemTransport`].
//!
//! Unlike `host-demo`, this binary does not depend on `pv-display-consumer`:
//! the host side here is a deliberately thin control-channel responder,
//! existing only to give the dedicated provider someone to negotiate with.

use flexi_logger::{DeferredNow, Logger, WriteMode};
use log::{info, warn, Record};
use pv_display_dedicated_provider::DedicatedDisplayProvider;
use pv_display_protocol::{
    capability_flags, control, encode, AddDisplay, DisplayInfo, DisplayKey, DisplayList,
    DriverCapabilities, Packet, Reassembler,
};
use pv_display_transport::{Client, ConnId, MemTransport, Transport};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const DOMAIN: u32 = 1;
const CONTROL_PORT: u32 = 1000;
const KEY: u32 = 7;
const EVENT_PORT: u32 = 2001;
const FRAMEBUFFER_PORT: u32 = 2000;
const DIRTY_RECTANGLES_PORT: u32 = 2002;
const CURSOR_BITMAP_PORT: u32 = 2003;

fn log_format(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(
        w,
        "{} [{:<5}] [{}:{}] [{}] {}",
        now.format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.file().unwrap_or("<unknown>"),
        record.line().unwrap_or(0),
        thread::current().name().unwrap_or("<unnamed>"),
        &record.args()
    )
}

#[derive(Default)]
struct HostState {
    channel: Option<Box<dyn Client>>,
    reassembler: Reassembler,
}

fn pump(channel: &dyn Client, reassembler: &mut Reassembler) -> Vec<Packet> {
    let mut packets = Vec::new();
    loop {
        let avail = match channel.available_data() {
            Ok(n) => n,
            Err(e) => {
                warn!("host stub: read failed: {e}");
                break;
            }
        };
        if avail == 0 {
            break;
        }
        let mut buf = vec![0u8; avail];
        if channel.recv(&mut buf).is_err() {
            break;
        }
        reassembler.push(&buf);
        loop {
            match reassembler.poll() {
                Ok(Some(p)) => packets.push(p),
                Ok(None) => break,
                Err(e) => {
                    warn!("host stub: malformed frame: {e}");
                    break;
                }
            }
        }
    }
    packets
}

fn send(channel: &dyn Client, packet_type: u32, payload: &[u8]) {
    match encode(packet_type, payload) {
        Ok(frame) => {
            if let Err(e) = channel.send(&frame) {
                warn!("host stub: send failed: {e}");
                return;
            }
            channel.notify_remote();
        }
        Err(e) => warn!("host stub: encode failed: {e}"),
    }
}

fn main() {
    Logger::try_with_str("info")
        .unwrap()
        .log_to_stdout()
        .write_mode(WriteMode::Direct)
        .format(log_format)
        .start()
        .unwrap();

    let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
    let display_created = Arc::new(AtomicBool::new(false));

    let host_state = Arc::new(Mutex::new(HostState::default()));
    let _control_listener = transport
        .listen(
            DOMAIN,
            CONTROL_PORT,
            ConnId::ANY,
            Box::new({
                let host_state = host_state.clone();
                move |client| {
                    info!("host stub: guest connected its control channel");

                    let on_data: pv_display_transport::DataCallback = {
                        let host_state = host_state.clone();
                        Box::new(move || {
                            let packets = {
                                let mut state = host_state.lock().unwrap();
                                let channel = state.channel.as_ref().unwrap().as_ref();
                                pump(channel, &mut state.reassembler)
                            };
                            for packet in packets {
                                dispatch(&host_state, packet);
                            }
                        })
                    };
                    let on_disconnect: pv_display_transport::DisconnectCallback =
                        Box::new(|| warn!("host stub: guest disconnected"));
                    client.register_callbacks(Some(on_data), Some(on_disconnect));
                    host_state.lock().unwrap().channel = Some(client);
                }
            }),
        )
        .expect("listen for guest control connection");

    fn dispatch(host_state: &Arc<Mutex<HostState>>, packet: Packet) {
        match packet.packet_type {
            control::DRIVER_CAPABILITIES => match DriverCapabilities::decode(&packet.payload) {
                Ok(caps) => {
                    info!(
                        "host stub: DRIVER_CAPABILITIES max_displays={} flags={:#x}",
                        caps.max_displays, caps.flags
                    );
                    let list = DisplayList {
                        displays: vec![DisplayInfo {
                            key: KEY,
                            x: 0,
                            y: 0,
                            width: 1920,
                            height: 1080,
                        }],
                    };
                    let state = host_state.lock().unwrap();
                    send(
                        state.channel.as_ref().unwrap().as_ref(),
                        control::HOST_DISPLAY_LIST,
                        &list.encode(),
                    );
                }
                Err(e) => warn!("host stub: malformed DRIVER_CAPABILITIES: {e}"),
            },
            control::ADVERTISED_DISPLAY_LIST => match DisplayList::decode(&packet.payload) {
                Ok(list) => {
                    info!("host stub: ADVERTISED_DISPLAY_LIST: {} display(s)", list.displays.len());
                    if list.displays.iter().any(|d| d.key == KEY) {
                        let req = AddDisplay {
                            key: KEY,
                            event_port: EVENT_PORT,
                            framebuffer_port: FRAMEBUFFER_PORT,
                            dirty_rectangles_port: DIRTY_RECTANGLES_PORT,
                            cursor_bitmap_port: CURSOR_BITMAP_PORT,
                        };
                        let state = host_state.lock().unwrap();
                        send(state.channel.as_ref().unwrap().as_ref(), control::ADD_DISPLAY, &req.encode());
                    }
                }
                Err(e) => warn!("host stub: malformed ADVERTISED_DISPLAY_LIST: {e}"),
            },
            control::DISPLAY_NO_LONGER_AVAILABLE => match DisplayKey::decode(&packet.payload) {
                Ok(k) => info!("host stub: display {} withdrawn", k.key),
                Err(e) => warn!("host stub: malformed DISPLAY_NO_LONGER_AVAILABLE: {e}"),
            },
            other => info!("host stub: ignoring packet type {other}"),
        }
    }

    let provider = DedicatedDisplayProvider::create(transport, DOMAIN, CONTROL_PORT)
        .expect("connect control channel to host stub");

    provider.register_fatal_error_handler(Some(Arc::new(|| {
        warn!("dedicated provider: fatal error, control channel lost");
    })));

    provider
        .core()
        .register_host_display_change_handler(Some(Arc::new({
            let provider = provider.clone();
            move |displays| {
                info!("dedicated provider: HOST_DISPLAY_LIST: {} display(s)", displays.len());
                provider
                    .advertise_displays(displays)
                    .expect("send ADVERTISED_DISPLAY_LIST");
            }
        })));

    provider.core().register_add_display_handler(Some(Arc::new({
        let provider = provider.clone();
        let display_created = display_created.clone();
        move |req| {
            info!("dedicated provider: ADD_DISPLAY key={}", req.key);
            let display = provider
                .core()
                .create_display(*req, 1920, 1080, 1920 * 4, None)
                .expect("open display channels");
            display
                .change_resolution(1920, 1080, 1920 * 4)
                .expect("send SET_DISPLAY");
            display_created.store(true, Ordering::SeqCst);
        }
    })));

    provider
        .core()
        .advertise_capabilities(1, capability_flags::RESIZE)
        .expect("send DRIVER_CAPABILITIES");

    for _ in 0..200 {
        if display_created.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    if display_created.load(Ordering::SeqCst) {
        info!("negotiation complete: display {KEY} created and resized");
    } else {
        info!("negotiation did not complete within the demo's wait window");
    }

    provider.destroy();
}
