//! Gateway: HTTP + WebSocket echo server.
//!
//! Single port serves a health endpoint and the WebSocket upgrade. Each upgrade is
//! negotiated against the allow-list, then handed to a [`crate::session::Session`].

mod connections;
pub mod protocol;
mod server;
mod socket;

pub use connections::ConnectionSet;
pub use protocol::ServerMessage;
pub use server::{router, run_gateway, run_gateway_with_shutdown, GatewayState};
pub use socket::{ChannelIo, TaskTimer};
