//! Guest-side PV display provider.
//!
//! Owns the control session to the consumer (capability/display negotiation)
//! and one [`display::Display`] per accepted display (framebuffer, event,
//! and optional dirty-rectangle/cursor channels).

pub mod config;
pub mod control;
pub mod display;
pub mod error;
pub mod fatal;

pub use config::{RingPages, SessionConfig};
pub use control::{AddDisplayHandler, ControlSession, HostDisplayChangeHandler, RemoveDisplayHandler};
pub use display::Display;
pub use error::SessionError;
pub use fatal::FatalErrorHandler;
