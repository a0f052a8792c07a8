//! Thin facade over [`pv_display_provider::ControlSession`] for callers that
//! only ever run a single display and never touch the full provider surface.
//!
//! Mirrors `dedicated_display_helper.c/h`: a `DedicatedDisplayProvider` wraps
//! a core `ControlSession`, forwarding `advertise_displays`/`destroy` and
//! translating the core's fatal-error callback into its own.

use pv_display_protocol::DisplayInfo;
use pv_display_provider::{ControlSession, FatalErrorHandler, SessionConfig, SessionError};
use pv_display_transport::Transport;
use std::sync::{Arc, Mutex};

/// A display provider reduced to the subset of [`ControlSession`] a
/// single-display caller needs.
#[derive(Clone)]
pub struct DedicatedDisplayProvider {
    core: ControlSession,
    fatal_error_handler: Arc<Mutex<Option<FatalErrorHandler>>>,
}

impl DedicatedDisplayProvider {
    /// Creates the inner [`ControlSession`] (establishing the control
    /// connection) and wires its fatal-error callback to forward into
    /// whatever handler this facade's caller later registers.
    pub fn create(
        transport: Arc<dyn Transport>,
        display_domain: u32,
        control_port: u32,
    ) -> Result<Self, SessionError> {
        let config = SessionConfig {
            control_port,
            ..SessionConfig::default()
        };
        let core = ControlSession::create_provider(transport, display_domain, config)?;

        let facade = Self {
            core,
            fatal_error_handler: Arc::new(Mutex::new(None)),
        };

        let handler_slot = facade.fatal_error_handler.clone();
        facade
            .core
            .register_fatal_error_handler(Some(Arc::new(move || {
                if let Some(h) = handler_slot.lock().unwrap().clone() {
                    h();
                }
            })));

        Ok(facade)
    }

    /// Direct access to the inner provider, for callers that outgrow the
    /// dedicated facade and need `create_display`, display handles, etc.
    pub fn core(&self) -> &ControlSession {
        &self.core
    }

    pub fn advertise_displays(&self, displays: &[DisplayInfo]) -> Result<(), SessionError> {
        self.core.advertise_displays(displays)
    }

    pub fn register_fatal_error_handler(&self, handler: Option<FatalErrorHandler>) {
        *self.fatal_error_handler.lock().unwrap() = handler;
    }

    pub fn destroy(&self) {
        self.core.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pv_display_transport::MemTransport;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn advertise_displays_forwards_to_core() {
        let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
        let (tx, rx) = mpsc::channel::<Box<dyn pv_display_transport::Client>>();
        let _server = transport
            .listen(
                0,
                1000,
                pv_display_transport::ConnId::ANY,
                Box::new(move |c| {
                    let _ = tx.send(c);
                }),
            )
            .unwrap();

        let provider = DedicatedDisplayProvider::create(transport, 0, 1000).unwrap();
        let host_side = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        provider
            .advertise_displays(&[DisplayInfo {
                key: 1,
                x: 0,
                y: 0,
                width: 1920,
                height: 1080,
            }])
            .unwrap();

        for _ in 0..100 {
            if host_side.available_data().unwrap() > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut buf = vec![0u8; host_side.available_data().unwrap()];
        host_side.recv(&mut buf).unwrap();
        let (packet_type, _) = pv_display_protocol::decode_one(&buf).unwrap();
        assert_eq!(packet_type, pv_display_protocol::control::ADVERTISED_DISPLAY_LIST);
    }

    #[test]
    fn fatal_error_forwards_through_facade() {
        let transport: Arc<dyn Transport> = Arc::new(MemTransport::new());
        let (tx, rx) = mpsc::channel::<Box<dyn pv_display_transport::Client>>();
        let _server = transport
            .listen(
                0,
                1000,
                pv_display_transport::ConnId::ANY,
                Box::new(move |c| {
                    let _ = tx.send(c);
                }),
            )
            .unwrap();

        let provider = DedicatedDisplayProvider::create(transport, 0, 1000).unwrap();
        let host_side = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        provider.register_fatal_error_handler(Some(Arc::new(move || {
            fired_clone.store(true, Ordering::SeqCst);
        })));

        host_side.disconnect();
        std::thread::sleep(Duration::from_millis(20));
        assert!(fired.load(Ordering::SeqCst));
    }
}
