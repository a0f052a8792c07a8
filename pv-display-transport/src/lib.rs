//! The IVC channel adapter boundary: connect/listen/send/recv over shared
//! local buffers, abstracted behind [`Transport`]/[`Client`]/[`Server`] so the
//! provider and consumer crates never touch a concrete hypervisor API.
//!
//! [`mem::MemTransport`] is an in-process loopback implementation used by
//! every crate's tests and by the `demos/` binaries; it is not a substitute
//! for a real IVC backend.

pub mod conn_id;
pub mod error;
pub mod mem;
pub mod traits;

pub use conn_id::ConnId;
pub use error::TransportError;
pub use mem::MemTransport;
pub use traits::{Client, ConnectCallback, DataCallback, DisconnectCallback, Server, Transport};
