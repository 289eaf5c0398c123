use crate::error::constants::{ERR_DISPATCHER_READ_LOCK, ERR_DISPATCHER_WRITE_LOCK};
use crate::error::{ProtocolError, Result};
use crate::protocol::event::{EventKind, EventSink, ServerEvent};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{trace, warn};

type HandlerFn = dyn Fn(&ServerEvent) -> Result<()> + Send + Sync + 'static;

/// Routes server events to the handler registered for their kind.
///
/// One handler per [`EventKind`]; registering again replaces the previous one.
/// Events without a handler are ignored.
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<EventKind, Arc<HandlerFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register<F>(&self, kind: EventKind, handler: F) -> Result<()>
    where
        F: Fn(&ServerEvent) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        handlers.insert(kind, Arc::new(handler));
        Ok(())
    }

    pub fn unregister(&self, kind: EventKind) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;
        Ok(handlers.remove(&kind).is_some())
    }

    /// Run the handler for this event. Returns whether one was registered.
    pub fn dispatch(&self, event: &ServerEvent) -> Result<bool> {
        // Clone the handler out so it runs without holding the lock
        let handler = {
            let handlers = self
                .handlers
                .read()
                .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_READ_LOCK.to_string()))?;
            handlers.get(&event.kind()).cloned()
        };

        match handler {
            Some(handler) => handler(event).map(|_| true),
            None => {
                trace!(event = %event.kind(), "No handler registered");
                Ok(false)
            }
        }
    }
}

impl EventSink for Dispatcher {
    fn emit(&self, event: ServerEvent) {
        if let Err(e) = self.dispatch(&event) {
            warn!(
                event = %event.kind(),
                session_id = ?event.session().map(|s| s.id()),
                error = %e,
                "Event handler failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn refused() -> ServerEvent {
        ServerEvent::ConnectionRefused {
            address: SocketAddr::from(([127, 0, 0, 1], 1)),
            reason: "banned".into(),
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_routes_by_kind() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        dispatcher
            .register(EventKind::ConnectionRefused, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert!(dispatcher.dispatch(&refused()).unwrap());
        dispatcher.emit(refused());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_unhandled_event_is_not_an_error() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.dispatch(&refused()).unwrap());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_handler_error_is_returned() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(EventKind::ConnectionRefused, |_| {
                Err(ProtocolError::Custom("boom".into()))
            })
            .unwrap();
        assert!(dispatcher.dispatch(&refused()).is_err());
        assert!(dispatcher.unregister(EventKind::ConnectionRefused).unwrap());
        assert!(!dispatcher.dispatch(&refused()).unwrap());
    }
}
