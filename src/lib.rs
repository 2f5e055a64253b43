//! vmstream: WebSocket tunnels from API clients to virtual machine devices.
//!
//! A tunnel request names an instance and a device channel (console, VNC,
//! serial, USB redirection, port forward, VSOCK, SSH). The instance is
//! resolved and validated, the device is dialed, the client is upgraded to
//! a WebSocket and bytes are relayed both ways until either side ends.

pub mod api;
pub mod config;
pub mod device;
pub mod dial;
pub mod error;
pub mod instance;
pub mod inventory;
pub mod logging;
pub mod metrics;
pub mod resolver;
pub mod stream;
