//! Drives a complete capability/display negotiation over
//! [`pv_display_transport::MemTransport`], logging each step from the
//! consumer's point of view.
//!
//! `MemTransport` is in-process only, so this demo also spins up the
//! provider side internally to have someone to talk to — in production the
//! provider lives in a separate guest domain and this binary would construct
//! a hypervisor-backed `Transport` instead.

use flexi_logger::{DeferredNow, Logger, WriteMode};
use log::{info, Record};
use pv_display_consumer::{ControlSession as ConsumerControlSession, DisplayBackend};
use pv_display_protocol::{capability_flags, DisplayInfo};
use pv_display_provider::{ControlSession as ProviderControlSession, SessionConfig};
use pv_display_transport::{MemTransport, Transport};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

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

fn main() {
    Logger::try_with_str("info")
        .unwrap()
        .log_to_stdout()
        .write_mode(WriteMode::Direct)
        .format(log_format)
        .start()
        .unwrap();

    let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
    const DOMAIN: u32 = 1;
    const CONTROL_PORT: u32 = 1000;
    const KEY: u32 = 1;

    let consumer = ConsumerControlSession::create_consumer(transport.clone(), DOMAIN, CONTROL_PORT)
        .expect("listen for provider control connection");

    consumer.register_control_connection_handler(Some(Arc::new({
        let consumer = consumer.clone();
        move |client| {
            info!("provider connected its control channel");
            consumer.finish_control_connection(client);
        }
    })));

    consumer.register_driver_capabilities_handler(Some(Arc::new({
        let consumer = consumer.clone();
        move |caps| {
            info!(
                "DRIVER_CAPABILITIES: max_displays={} flags={:#x}",
                caps.max_displays, caps.flags
            );
            consumer
                .display_list(&[DisplayInfo {
                    key: KEY,
                    x: 0,
                    y: 0,
                    width: 1920,
                    height: 1080,
                }])
                .expect("send HOST_DISPLAY_LIST");
        }
    })));

    let set_display_seen = Arc::new(AtomicBool::new(false));
    let backend_slot: Arc<Mutex<Option<DisplayBackend>>> = Arc::new(Mutex::new(None));
    consumer.register_advertised_display_list_handler(Some(Arc::new({
        let consumer = consumer.clone();
        let transport = transport.clone();
        let backend_slot = backend_slot.clone();
        let set_display_seen = set_display_seen.clone();
        move |displays| {
            info!("ADVERTISED_DISPLAY_LIST: {} display(s)", displays.len());
            for d in displays {
                let backend = DisplayBackend::create_pv_display_backend(
                    transport.clone(),
                    DOMAIN,
                    d.key,
                    2000,
                    2001,
                    2002,
                    2003,
                );
                backend.register_set_display_handler(Some(Arc::new({
                    let seen = set_display_seen.clone();
                    move |sd| {
                        info!("SET_DISPLAY: {}x{} stride={}", sd.width, sd.height, sd.stride);
                        seen.store(true, Ordering::SeqCst);
                    }
                })));
                backend.start_servers().expect("open display listeners");
                *backend_slot.lock().unwrap() = Some(backend);
                consumer
                    .add_display(d.key, 2000, 2001, 2002, 2003)
                    .expect("send ADD_DISPLAY");
            }
        }
    })));

    let provider_config = SessionConfig {
        control_port: CONTROL_PORT,
        ..SessionConfig::default()
    };
    let provider = ProviderControlSession::create_provider(transport, DOMAIN, provider_config)
        .expect("provider connects control channel");
    provider
        .advertise_capabilities(4, capability_flags::RESIZE | capability_flags::HOTPLUG)
        .expect("send DRIVER_CAPABILITIES");

    provider.register_host_display_change_handler(Some(Arc::new({
        let provider = provider.clone();
        move |displays| {
            info!("HOST_DISPLAY_LIST: {} display(s)", displays.len());
            provider
                .advertise_displays(displays)
                .expect("send ADVERTISED_DISPLAY_LIST");
        }
    })));

    provider.register_add_display_handler(Some(Arc::new({
        let provider = provider.clone();
        move |req| {
            info!("ADD_DISPLAY: key={}", req.key);
            let display = provider
                .create_display(*req, 1920, 1080, 1920 * 4, None)
                .expect("open display channels");
            display
                .change_resolution(1920, 1080, 1920 * 4)
                .expect("send SET_DISPLAY");
        }
    })));

    for _ in 0..200 {
        if set_display_seen.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    if set_display_seen.load(Ordering::SeqCst) {
        info!("negotiation complete: consumer observed SET_DISPLAY");
    } else {
        info!("negotiation did not complete within the demo's wait window");
    }

    provider.destroy();
    consumer.destroy();
}
