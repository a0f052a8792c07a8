//! Trait boundary the core protocol logic is written against. A real
//! implementation adapts a hypervisor's IVC library to these traits; tests and
//! demos use [`crate::mem::MemTransport`].

use crate::conn_id::ConnId;
use crate::error::TransportError;

/// Invoked (possibly from a background/interrupt-like context) whenever new
/// bytes are available to read, or the peer has disconnected. Registering a
/// new callback replaces the previous one; registering `None` silently drops
/// subsequently matching events.
pub type DataCallback = Box<dyn Fn() + Send + Sync>;
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync>;
pub type ConnectCallback = Box<dyn Fn(Box<dyn Client>) + Send + Sync>;

/// One end of a connected IVC channel.
///
/// Reads and writes through a `Client` are exact-length: `recv` never
/// short-returns once `available_data() >= requested`, and `send` either
/// writes the whole buffer atomically or fails with
/// [`TransportError::ResourceExhausted`] without writing a partial frame.
pub trait Client: Send + Sync {
    fn conn_id(&self) -> ConnId;
    fn domain(&self) -> u32;
    fn port(&self) -> u32;

    /// Sends `bytes` as a single atomic write.
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Reads exactly `buf.len()` bytes, or fails with
    /// [`TransportError::WouldBlock`] if fewer are currently available.
    fn recv(&self, buf: &mut [u8]) -> Result<(), TransportError>;

    fn available_data(&self) -> Result<usize, TransportError>;
    fn available_space(&self) -> Result<usize, TransportError>;

    /// Raw pointer into the channel's shared local buffer (the IVC shared
    /// memory segment, minus the page of transport metadata at its head).
    /// Stable for the client's lifetime per the transport contract.
    ///
    /// # Safety contract
    /// Callers must stay within `buffer_size()` bytes and must not assume any
    /// synchronization beyond what the dirty-rectangle channel provides — the
    /// library does not serialize per-pixel writes against reads.
    fn local_buffer(&self) -> *mut u8;
    fn buffer_size(&self) -> usize;

    /// Wakes the peer after a send. Implementations may call their
    /// underlying doorbell more than once; the contract only requires
    /// at-least-once wake-on-send.
    fn notify_remote(&self);

    fn register_callbacks(&self, on_data: Option<DataCallback>, on_disconnect: Option<DisconnectCallback>);
    fn enable_events(&self);
    fn disable_events(&self);

    /// Re-establishes this client against a (possibly new) listener at
    /// `(domain, port)`, preserving the local buffer and its contents.
    fn reconnect(&self, domain: u32, port: u32) -> Result<(), TransportError>;

    fn disconnect(&self);
}

/// A listening endpoint. Incoming connections are delivered to the
/// `on_connect` callback supplied to [`Transport::listen`]; `Server` itself
/// only exposes teardown.
pub trait Server: Send + Sync {
    fn port(&self) -> u32;
    fn close(&self);
}

/// Factory for connecting and listening on the IVC substrate.
pub trait Transport: Send + Sync {
    fn connect(
        &self,
        domain: u32,
        port: u32,
        pages: u32,
        conn_id: ConnId,
    ) -> Result<Box<dyn Client>, TransportError>;

    fn listen(
        &self,
        domain: u32,
        port: u32,
        conn_id: ConnId,
        on_connect: ConnectCallback,
    ) -> Result<Box<dyn Server>, TransportError>;
}
