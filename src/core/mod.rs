//! # Core Codec Components
//!
//! Packet framing, payload transforms and the value model carried in frames.
//!
//! ## Components
//! - **Header**: 1-byte flag record at the front of every frame
//! - **Transform**: compression and encryption strategies
//! - **Data**: `DataCollection` values and the ZERO / MSG_PACK formats
//! - **Packet**: outbound unit of data with priority and recipients
//! - **Encoder / Decoder**: framing and the per-session read-state machine
//! - **Codec**: tokio-util adapter for `Framed` streams
//!
//! ## Wire Format
//! ```text
//! [Header(1)] [Length(2 | 4, stream transports only)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum payload size: 16MB by default (prevents memory exhaustion)
//! - Length validation before allocation
//! - Decompression output is bounded

pub mod codec;
pub mod data;
pub mod decoder;
pub mod encoder;
pub mod header;
pub mod packet;
pub mod transform;
