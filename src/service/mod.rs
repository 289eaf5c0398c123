//! # Service
//!
//! [`NetworkService`] wires configuration, session manager, engine and handler
//! workers into a running server. [`SocketClient`] is the matching raw socket
//! client.

pub mod client;
pub mod server;

pub use client::SocketClient;
pub use server::NetworkService;
