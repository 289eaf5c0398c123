//! # Protocol
//!
//! Boundary between the network engine and application code.
//!
//! Inbound, the engine emits [`ServerEvent`]s. They are queued as
//! [`Request`]s, ordered by priority, and handed to the [`Dispatcher`] on the
//! handler threads. Outbound, handlers build a [`Response`] and write it.

pub mod dispatcher;
pub mod event;
pub mod request;
pub mod response;

pub use dispatcher::Dispatcher;
pub use event::{EventKind, EventSink, ServerEvent};
pub use request::{Request, RequestPriority, RequestQueue};
pub use response::Response;
