//! Device control servers.
//!
//! Two front-ends over the same [`DeviceApi`](crate::service_api::DeviceApi):
//! the local HTTP server bound to `127.0.0.1` for the on-host CLI, and the
//! remote length-delimited JSON protocol spoken over a control-plane tunnel.

pub mod local;
pub mod remote;
