//! subecho core library: subprotocol negotiation, the echo gateway and its per-connection
//! session state machine, and the client harness that exercises them.

pub mod config;
pub mod error;
pub mod gateway;
pub mod harness;
pub mod init;
pub mod negotiate;
pub mod session;
