//! Configuration management
//!
//! Node settings: identity, transport selection, mining parameters, ports and
//! file locations.

pub mod settings;

pub use settings::{Ports, Settings, TransportKind};
