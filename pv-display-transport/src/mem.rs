//! In-process loopback `Transport`: two `MemTransport` handles sharing the
//! same registry behave like a guest and host domain connected over IVC,
//! without any actual hypervisor. Used by every crate's tests and by the
//! `demos/` binaries.

use crate::conn_id::ConnId;
use crate::error::TransportError;
use crate::traits::{Client, ConnectCallback, DataCallback, DisconnectCallback, Server, Transport};
use crossbeam::queue::ArrayQueue;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

/// IVC page size assumed by the loopback transport (matches the hypervisor's
/// page size in the protocol's ring-buffer sizing conventions).
pub const PAGE_SIZE: usize = 4096;

struct SharedBuffer {
    data: Box<[u8]>,
}

// The buffer simulates hypervisor shared memory: both domains hold a raw
// pointer into it with no synchronization beyond the dirty-rect channel.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            data: vec![0u8; size].into_boxed_slice(),
        })
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

#[derive(Default)]
struct Callbacks {
    on_data: Option<DataCallback>,
    on_disconnect: Option<DisconnectCallback>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Guest,
    Host,
}

/// Shared state for one connected pair. `to_guest`/`to_host` are the two
/// directional byte queues; `buffer` is the shared local buffer both ends map.
struct ConnCore {
    to_guest: ArrayQueue<u8>,
    to_host: ArrayQueue<u8>,
    buffer: Arc<SharedBuffer>,
    disconnected: AtomicBool,
    guest_callbacks: Mutex<Callbacks>,
    host_callbacks: Mutex<Callbacks>,
    guest_events_enabled: AtomicBool,
    host_events_enabled: AtomicBool,
    guest_disconnect_delivered: AtomicBool,
    host_disconnect_delivered: AtomicBool,
}

impl ConnCore {
    fn new(queue_capacity: usize, buffer: Arc<SharedBuffer>) -> Arc<Self> {
        Arc::new(Self {
            to_guest: ArrayQueue::new(queue_capacity),
            to_host: ArrayQueue::new(queue_capacity),
            buffer,
            disconnected: AtomicBool::new(false),
            guest_callbacks: Mutex::new(Callbacks::default()),
            host_callbacks: Mutex::new(Callbacks::default()),
            guest_events_enabled: AtomicBool::new(true),
            host_events_enabled: AtomicBool::new(true),
            guest_disconnect_delivered: AtomicBool::new(false),
            host_disconnect_delivered: AtomicBool::new(false),
        })
    }
}

fn fire_async(name: &'static str, f: impl FnOnce() + Send + 'static) {
    if let Err(e) = thread::Builder::new().name(name.into()).spawn(f) {
        warn!("failed to spawn callback thread {name}: {e}");
    }
}

/// One endpoint of a loopback connection.
struct MemClient {
    core: RwLock<Arc<ConnCore>>,
    side: Side,
    conn_id: ConnId,
    domain: u32,
    port: u32,
    registry: Arc<Registry>,
}

impl Client for MemClient {
    fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    fn domain(&self) -> u32 {
        self.domain
    }

    fn port(&self) -> u32 {
        self.port
    }

    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let core = self.core.read().unwrap().clone();
        if core.disconnected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }

        let (outbound, peer_events): (&ArrayQueue<u8>, &AtomicBool) = match self.side {
            Side::Guest => (&core.to_host, &core.host_events_enabled),
            Side::Host => (&core.to_guest, &core.guest_events_enabled),
        };

        let available = outbound.capacity() - outbound.len();
        if bytes.len() > available {
            return Err(TransportError::ResourceExhausted {
                needed: bytes.len(),
                available,
            });
        }

        for &b in bytes {
            // capacity already checked above; this cannot fail.
            let _ = outbound.push(b);
        }

        // The data callback runs off-thread, simulating the "may be invoked
        // from an asynchronous context" transport contract. It is
        // looked up again inside the spawned thread so a callback registered
        // or cleared between now and delivery is respected.
        if peer_events.load(Ordering::Acquire) {
            let core_arc = core.clone();
            let which = self.side;
            fire_async("pv-display-mem-on-data", move || {
                let guard = match which {
                    Side::Guest => core_arc.host_callbacks.lock().unwrap(),
                    Side::Host => core_arc.guest_callbacks.lock().unwrap(),
                };
                if let Some(cb) = guard.on_data.as_ref() {
                    cb();
                }
            });
        }

        trace!("mem transport send {} bytes", bytes.len());
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let core = self.core.read().unwrap().clone();
        let inbound = match self.side {
            Side::Guest => &core.to_guest,
            Side::Host => &core.to_host,
        };

        if inbound.len() < buf.len() {
            if core.disconnected.load(Ordering::Acquire) {
                return Err(TransportError::Disconnected);
            }
            return Err(TransportError::WouldBlock);
        }

        for slot in buf.iter_mut() {
            *slot = inbound.pop().expect("length checked above");
        }
        Ok(())
    }

    fn available_data(&self) -> Result<usize, TransportError> {
        let core = self.core.read().unwrap().clone();
        let inbound = match self.side {
            Side::Guest => &core.to_guest,
            Side::Host => &core.to_host,
        };
        Ok(inbound.len())
    }

    fn available_space(&self) -> Result<usize, TransportError> {
        let core = self.core.read().unwrap().clone();
        let outbound = match self.side {
            Side::Guest => &core.to_host,
            Side::Host => &core.to_guest,
        };
        Ok(outbound.capacity() - outbound.len())
    }

    fn local_buffer(&self) -> *mut u8 {
        self.core.read().unwrap().buffer.as_mut_ptr()
    }

    fn buffer_size(&self) -> usize {
        self.core.read().unwrap().buffer.len()
    }

    fn notify_remote(&self) {
        // Delivery already happens synchronously (off-thread) on send; a
        // real hypervisor-backed transport would ring its doorbell here.
        trace!("mem transport notify_remote (no-op, delivery is immediate)");
    }

    fn register_callbacks(
        &self,
        on_data: Option<DataCallback>,
        on_disconnect: Option<DisconnectCallback>,
    ) {
        let core = self.core.read().unwrap().clone();
        let mut guard = match self.side {
            Side::Guest => core.guest_callbacks.lock().unwrap(),
            Side::Host => core.host_callbacks.lock().unwrap(),
        };
        guard.on_data = on_data;
        guard.on_disconnect = on_disconnect;
    }

    fn enable_events(&self) {
        let core = self.core.read().unwrap().clone();
        match self.side {
            Side::Guest => core.guest_events_enabled.store(true, Ordering::Release),
            Side::Host => core.host_events_enabled.store(true, Ordering::Release),
        }
    }

    fn disable_events(&self) {
        let core = self.core.read().unwrap().clone();
        match self.side {
            Side::Guest => core.guest_events_enabled.store(false, Ordering::Release),
            Side::Host => core.host_events_enabled.store(false, Ordering::Release),
        }
    }

    fn reconnect(&self, domain: u32, port: u32) -> Result<(), TransportError> {
        let buffer = self.core.read().unwrap().buffer.clone();
        let capacity = match self.side {
            Side::Guest => self.core.read().unwrap().to_host.capacity(),
            Side::Host => self.core.read().unwrap().to_guest.capacity(),
        };

        let new_core = ConnCore::new(capacity, buffer);
        self.registry
            .complete_connect(domain, port, self.conn_id, new_core.clone(), self.registry.clone())?;

        *self.core.write().unwrap() = new_core;
        debug!("mem transport client reconnected to ({domain}, {port})");
        Ok(())
    }

    fn disconnect(&self) {
        let core = self.core.read().unwrap().clone();
        core.disconnected.store(true, Ordering::Release);

        let (own_delivered, own_callbacks, peer_delivered, peer_callbacks) = match self.side {
            Side::Guest => (
                &core.guest_disconnect_delivered,
                &core.guest_callbacks,
                &core.host_disconnect_delivered,
                &core.host_callbacks,
            ),
            Side::Host => (
                &core.host_disconnect_delivered,
                &core.host_callbacks,
                &core.guest_disconnect_delivered,
                &core.guest_callbacks,
            ),
        };

        if own_delivered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(cb) = own_callbacks.lock().unwrap().on_disconnect.as_ref() {
                cb();
            }
        }

        if peer_delivered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let cb = peer_callbacks.lock().unwrap().on_disconnect.take();
            if let Some(cb) = cb {
                fire_async("pv-display-mem-on-disconnect", move || cb());
            }
        }
    }
}

struct Listener {
    conn_id: ConnId,
    on_connect: ConnectCallback,
}

struct Registry {
    listeners: Mutex<HashMap<(u32, u32), Listener>>,
}

impl Registry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
        })
    }

    fn complete_connect(
        &self,
        domain: u32,
        port: u32,
        conn_id: ConnId,
        host_core: Arc<ConnCore>,
        registry: Arc<Registry>,
    ) -> Result<(), TransportError> {
        let listeners = self.listeners.lock().unwrap();
        let listener = listeners
            .get(&(domain, port))
            .ok_or(TransportError::NotFound)?;
        if !listener.conn_id.is_any() && !conn_id.is_any() && listener.conn_id != conn_id {
            return Err(TransportError::NotFound);
        }

        let host_client: Box<dyn Client> = Box::new(MemClient {
            core: RwLock::new(host_core),
            side: Side::Host,
            conn_id,
            domain,
            port,
            registry,
        });
        (listener.on_connect)(host_client);
        Ok(())
    }
}

struct MemServer {
    port: u32,
    domain: u32,
    conn_id: ConnId,
    registry: Arc<Registry>,
}

impl Server for MemServer {
    fn port(&self) -> u32 {
        self.port
    }

    fn close(&self) {
        self.registry
            .listeners
            .lock()
            .unwrap()
            .remove(&(self.domain, self.port));
    }
}

/// Loopback transport: each distinct `MemTransport` handle cloned from the
/// same root shares one [`Registry`], so a "guest" handle's `connect` can
/// reach a "host" handle's `listen`.
#[derive(Clone)]
pub struct MemTransport {
    registry: Arc<Registry>,
}

impl Default for MemTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTransport {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }
}

impl Transport for MemTransport {
    fn connect(
        &self,
        domain: u32,
        port: u32,
        pages: u32,
        conn_id: ConnId,
    ) -> Result<Box<dyn Client>, TransportError> {
        if pages == 0 {
            return Err(TransportError::InvalidArgument("pages must be > 0".into()));
        }
        let buffer_size = (pages as usize - 1) * PAGE_SIZE;
        let buffer = SharedBuffer::new(buffer_size.max(1));
        let queue_capacity = buffer_size.max(PAGE_SIZE);

        let guest_core = ConnCore::new(queue_capacity, buffer);
        self.registry.complete_connect(
            domain,
            port,
            conn_id,
            guest_core.clone(),
            self.registry.clone(),
        )?;

        Ok(Box::new(MemClient {
            core: RwLock::new(guest_core),
            side: Side::Guest,
            conn_id,
            domain,
            port,
            registry: self.registry.clone(),
        }))
    }

    fn listen(
        &self,
        domain: u32,
        port: u32,
        conn_id: ConnId,
        on_connect: ConnectCallback,
    ) -> Result<Box<dyn Server>, TransportError> {
        let mut listeners = self.registry.listeners.lock().unwrap();
        listeners.insert((domain, port), Listener { conn_id, on_connect });
        drop(listeners);

        Ok(Box::new(MemServer {
            port,
            domain,
            conn_id,
            registry: self.registry.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn connect_without_listener_fails() {
        let t = MemTransport::new();
        let err = t.connect(0, 1000, 2, ConnId::ANY).unwrap_err();
        assert!(matches!(err, TransportError::NotFound));
    }

    #[test]
    fn listen_then_connect_delivers_host_client() {
        let t = MemTransport::new();
        let (tx, rx) = mpsc::channel::<Box<dyn Client>>();
        let _server = t
            .listen(
                0,
                1000,
                ConnId::ANY,
                Box::new(move |client| {
                    let _ = tx.send(client);
                }),
            )
            .unwrap();

        let guest = t.connect(0, 1000, 2, ConnId(7)).unwrap();
        let host = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        assert_eq!(guest.conn_id(), ConnId(7));
        assert_eq!(host.conn_id(), ConnId(7));
    }

    #[test]
    fn send_then_recv_round_trips_bytes() {
        let t = MemTransport::new();
        let (tx, rx) = mpsc::channel::<Box<dyn Client>>();
        let _server = t
            .listen(
                0,
                1000,
                ConnId::ANY,
                Box::new(move |client| {
                    let _ = tx.send(client);
                }),
            )
            .unwrap();

        let guest = t.connect(0, 1000, 2, ConnId::ANY).unwrap();
        let host = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        guest.send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        // MemClient delivers synchronously into the queue; recv polls it.
        for _ in 0..100 {
            if host.available_data().unwrap() >= 5 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        host.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn send_exceeding_available_space_is_resource_exhausted() {
        let t = MemTransport::new();
        let (tx, rx) = mpsc::channel::<Box<dyn Client>>();
        let _server = t
            .listen(0, 1000, ConnId::ANY, Box::new(move |c| { let _ = tx.send(c); }))
            .unwrap();
        let guest = t.connect(0, 1000, 2, ConnId::ANY).unwrap();
        let _host = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let oversized = vec![0u8; PAGE_SIZE * 2];
        let err = guest.send(&oversized).unwrap_err();
        assert!(matches!(err, TransportError::ResourceExhausted { .. }));
    }

    #[test]
    fn disconnect_is_delivered_exactly_once_to_each_side() {
        let t = MemTransport::new();
        let (tx, rx) = mpsc::channel::<Box<dyn Client>>();
        let _server = t
            .listen(0, 1000, ConnId::ANY, Box::new(move |c| { let _ = tx.send(c); }))
            .unwrap();
        let guest = t.connect(0, 1000, 2, ConnId::ANY).unwrap();
        let host = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let guest_fired = Arc::new(AtomicBool::new(false));
        let host_fired = Arc::new(AtomicBool::new(false));
        {
            let f = guest_fired.clone();
            guest.register_callbacks(None, Some(Box::new(move || f.store(true, Ordering::SeqCst))));
        }
        {
            let f = host_fired.clone();
            host.register_callbacks(None, Some(Box::new(move || f.store(true, Ordering::SeqCst))));
        }

        guest.disconnect();
        thread::sleep(Duration::from_millis(20));

        assert!(guest_fired.load(Ordering::SeqCst));
        assert!(host_fired.load(Ordering::SeqCst));

        // A second disconnect call must not refire.
        guest_fired.store(false, Ordering::SeqCst);
        guest.disconnect();
        thread::sleep(Duration::from_millis(20));
        assert!(!guest_fired.load(Ordering::SeqCst));
    }
}
