//! # Reader
//!
//! Inbound side of every transport.
//!
//! Stream transports (socket, websocket, KCP) feed raw bytes through the
//! session's read-state machine, so frames may span reads. Datagram sockets
//! decode each datagram on its own, then use the datagram policy to find the
//! logical session by convey id.
//!
//! Every complete message becomes a `SessionRead` event. A framing, transform
//! or deserialization error is fatal for the session: the handler gets a
//! `SessionException` and the session is closed with `LostInRead`.

use crate::engine::kcp::{read_conv, KcpOutput};
use crate::engine::EngineContext;
use crate::error::{ProtocolError, Result};
use crate::protocol::event::ServerEvent;
use crate::session::datagram_policy::EMPTY_DATAGRAM_CONVEY_ID;
use crate::session::{DisconnectCause, Session, SessionHandle};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, trace, warn};

/// Decode stream bytes for `session` and emit one event per complete message.
///
/// Returns the number of messages emitted.
pub fn on_stream_bytes(ctx: &EngineContext, session: &Arc<Session>, data: &[u8]) -> Result<usize> {
    session.record_read(data.len());
    ctx.statistics.bytes_received(data.len() as u64);

    let frames = session.decode(&ctx.decoder, data).inspect_err(|_| {
        ctx.statistics.decode_error();
    })?;

    let count = frames.len();
    for frame in frames {
        let message = frame.to_collection().inspect_err(|_| {
            ctx.statistics.decode_error();
        })?;
        ctx.statistics.packet_read();
        ctx.manager.events().emit(ServerEvent::SessionRead {
            session: session.clone(),
            message,
        });
    }
    Ok(count)
}

/// Report a session-fatal error to the handler, then close the session.
pub fn fail_session(ctx: &EngineContext, session: &Arc<Session>, error: ProtocolError) {
    warn!(session_id = session.id(), error = %error, "Session failed");
    ctx.manager.events().emit(ServerEvent::SessionException {
        session: session.clone(),
        error: error.to_string(),
    });
    ctx.manager.close_session(session, DisconnectCause::LostInRead);
}

/// Handle bytes read from a stream connection. Returns `false` when the session was closed.
fn consume(ctx: &EngineContext, session: &Arc<Session>, data: &[u8]) -> bool {
    match on_stream_bytes(ctx, session, data) {
        Ok(_) => true,
        Err(e) if e.is_session_fatal() => {
            fail_session(ctx, session, e);
            false
        }
        Err(e) => {
            debug!(session_id = session.id(), error = %e, "Read error ignored");
            true
        }
    }
}

/// Read loop of a raw socket connection.
pub async fn read_socket<R>(ctx: Arc<EngineContext>, session: Arc<Session>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = ctx.buffers.acquire();
    let cause = loop {
        let read = tokio::select! {
            _ = session.cancellation().cancelled() => return,
            _ = ctx.cancel.cancelled() => break DisconnectCause::ServerDown,
            read = reader.read(&mut buffer) => read,
        };

        match read {
            Ok(0) => break DisconnectCause::Lost,
            Ok(n) => {
                if !consume(&ctx, &session, &buffer[..n]) {
                    return;
                }
            }
            Err(e) => {
                debug!(session_id = session.id(), error = %e, "Socket read failed");
                break DisconnectCause::LostInRead;
            }
        }
    };
    ctx.manager.close_session(&session, cause);
}

/// Read loop of a websocket connection. Only binary messages carry packets.
pub async fn read_websocket<S>(ctx: Arc<EngineContext>, session: Arc<Session>, mut stream: S)
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    let cause = loop {
        let next = tokio::select! {
            _ = session.cancellation().cancelled() => return,
            _ = ctx.cancel.cancelled() => break DisconnectCause::ServerDown,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Binary(data))) => {
                if !consume(&ctx, &session, &data) {
                    return;
                }
            }
            Some(Ok(Message::Close(_))) => break DisconnectCause::ClientRequest,
            Some(Ok(other)) => {
                trace!(session_id = session.id(), kind = ?other, "Non-binary websocket message ignored");
            }
            Some(Err(e)) => {
                debug!(session_id = session.id(), error = %e, "Websocket read failed");
                break DisconnectCause::LostInRead;
            }
            None => break DisconnectCause::Lost,
        }
    };
    ctx.manager.close_session(&session, cause);
}

/// Handle one datagram: decode it, find its session by convey id and emit the message.
///
/// Datagrams that cannot be decoded or carry no convey id are dropped.
pub fn on_datagram(
    ctx: &EngineContext,
    data: &[u8],
    remote: SocketAddr,
    outbound: &mpsc::Sender<(SocketAddr, Bytes)>,
) -> Option<Arc<Session>> {
    ctx.statistics.bytes_received(data.len() as u64);

    let message = match ctx.decoder.decode_datagram(data).and_then(|frame| {
        frame.map(|frame| frame.to_collection()).transpose()
    }) {
        Ok(Some(message)) => message,
        Ok(None) => return None,
        Err(e) => {
            ctx.statistics.decode_error();
            debug!(peer = %remote, error = %e, "Datagram dropped");
            return None;
        }
    };

    let (convey_id, message) = ctx.datagram_policy.apply_policy(message);
    let Some(message) = message.filter(|_| convey_id != EMPTY_DATAGRAM_CONVEY_ID) else {
        debug!(peer = %remote, convey_id, "Datagram without convey id or message dropped");
        return None;
    };

    let session = match ctx.manager.resolve_datagram(convey_id, remote, outbound) {
        Ok(session) => session,
        Err(e) => {
            debug!(peer = %remote, convey_id, error = %e, "Datagram session refused");
            return None;
        }
    };
    if session.is_closed() {
        return None;
    }

    session.record_read(data.len());
    ctx.statistics.packet_read();
    ctx.manager.events().emit(ServerEvent::SessionRead {
        session: session.clone(),
        message,
    });
    Some(session)
}

/// Read loop of a shared UDP socket carrying datagram sessions.
pub async fn read_datagram_socket(
    ctx: Arc<EngineContext>,
    socket: Arc<UdpSocket>,
    outbound: mpsc::Sender<(SocketAddr, Bytes)>,
) {
    let mut buffer = ctx.buffers.acquire();
    loop {
        let received = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };
        match received {
            Ok((n, remote)) => {
                on_datagram(&ctx, &buffer[..n], remote, &outbound);
            }
            Err(e) => {
                // ICMP port unreachable surfaces here on some platforms
                debug!(error = %e, "Datagram receive failed");
            }
        }
    }
    debug!("Datagram reader stopped");
}

/// Drain outbound datagrams (and KCP segments) onto a UDP socket.
pub async fn send_datagrams(
    ctx: Arc<EngineContext>,
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::Receiver<(SocketAddr, Bytes)>,
) {
    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            next = outbound.recv() => next,
        };
        let Some((remote, bytes)) = next else {
            break;
        };
        if let Err(e) = socket.send_to(&bytes, remote).await {
            ctx.statistics.write_error();
            debug!(peer = %remote, error = %e, "Datagram send failed");
        }
    }
    debug!("Datagram sender stopped");
}

/// Feed one UDP segment into its KCP control block, creating the session on first contact.
///
/// # Errors
/// `IllegalState` when no KCP factory is configured; control block errors.
pub fn on_kcp_segment(
    ctx: &EngineContext,
    segment: &[u8],
    remote: SocketAddr,
    output: &KcpOutput,
) -> Result<Option<Arc<Session>>> {
    let Some(conv) = read_conv(segment) else {
        trace!(peer = %remote, len = segment.len(), "Short KCP segment dropped");
        return Ok(None);
    };

    let session = match ctx.manager.get_session_by_kcp(conv) {
        Some(session) => session,
        None => {
            let factory = ctx.kcp_factory.as_ref().ok_or_else(|| {
                ProtocolError::IllegalState("No KCP channel factory configured".to_string())
            })?;
            let channel = factory.create(conv, remote, output.clone())?;
            ctx.manager.create_kcp_session(channel)?
        }
    };
    if session.is_closed() {
        return Ok(None);
    }

    let SessionHandle::Kcp { channel } = session.handle() else {
        return Ok(None);
    };
    if let Err(e) = channel.input(segment) {
        fail_session(ctx, &session, e);
        return Ok(None);
    }

    loop {
        match channel.recv() {
            Ok(Some(message)) => {
                if !consume(ctx, &session, &message) {
                    return Ok(None);
                }
            }
            Ok(None) => break,
            Err(e) => {
                fail_session(ctx, &session, e);
                return Ok(None);
            }
        }
    }
    Ok(Some(session))
}

/// Read loop of a UDP socket carrying KCP sessions.
pub async fn read_kcp_socket(ctx: Arc<EngineContext>, socket: Arc<UdpSocket>, output: KcpOutput) {
    let mut buffer = ctx.buffers.acquire();
    loop {
        let received = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };
        match received {
            Ok((n, remote)) => {
                if let Err(e) = on_kcp_segment(&ctx, &buffer[..n], remote, &output) {
                    debug!(peer = %remote, error = %e, "KCP segment dropped");
                }
            }
            Err(e) => debug!(error = %e, "KCP receive failed"),
        }
    }
    debug!("KCP reader stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::data::{DataCollection, DataType, DataValue};
    use crate::core::decoder::BinaryPacketDecoder;
    use crate::core::encoder::BinaryPacketEncoder;
    use crate::core::packet::{Packet, TransportType};
    use crate::protocol::event::{EventKind, EventSink};
    use crate::session::datagram_policy::{DefaultDatagramPacketPolicy, DATAGRAM_CONVEY_ID_KEY, DATAGRAM_MESSAGE_DATA_KEY};
    use crate::session::{ChannelId, SessionManager, SessionSettings};
    use crate::utils::buffer_pool::BufferPool;
    use crate::utils::metrics::NetworkStatistics;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<EventKind>>);

    impl EventSink for Recorder {
        fn emit(&self, event: ServerEvent) {
            self.0.lock().unwrap().push(event.kind());
        }
    }

    fn context(events: Arc<Recorder>) -> EngineContext {
        let manager = Arc::new(SessionManager::new(
            SessionSettings::default(),
            events,
            Arc::new(NetworkStatistics::new()),
        ));
        EngineContext::new(
            manager,
            Arc::new(BinaryPacketDecoder::new()),
            Arc::new(DefaultDatagramPacketPolicy),
            None,
            BufferPool::new(1, 64),
        )
    }

    fn framed(message: &DataCollection, transport: TransportType) -> Bytes {
        let payload = message.serialize(DataType::Zero).unwrap();
        BinaryPacketEncoder::new()
            .encode(Packet::new(payload, transport))
            .unwrap()
            .data()
            .clone()
    }

    #[test]
    fn test_fatal_stream_error_closes_with_exception() {
        let events = Arc::new(Recorder::default());
        let ctx = context(events.clone());
        let (tx, _rx) = mpsc::channel(1);
        let session = ctx
            .manager
            .create_socket_session(ChannelId(1), SocketAddr::from(([127, 0, 0, 1], 1)), tx)
            .unwrap();

        // Uncounted header on a stream transport
        assert!(!consume(&ctx, &session, &[0x00, 0x01]));
        assert!(session.is_closed());
        assert_eq!(
            *events.0.lock().unwrap(),
            vec![EventKind::ChannelActive, EventKind::SessionException, EventKind::ChannelInactive]
        );
        assert_eq!(ctx.statistics.closed_with(DisconnectCause::LostInRead), 1);
    }

    #[test]
    fn test_stream_bytes_emit_reads() {
        let events = Arc::new(Recorder::default());
        let ctx = context(events.clone());
        let (tx, _rx) = mpsc::channel(1);
        let session = ctx
            .manager
            .create_socket_session(ChannelId(1), SocketAddr::from(([127, 0, 0, 1], 1)), tx)
            .unwrap();

        let mut message = DataCollection::new_array();
        message.push(DataValue::Int(7));
        let once = framed(&message, TransportType::Socket);
        let mut bytes = once.to_vec();
        bytes.extend_from_slice(&once);

        assert_eq!(on_stream_bytes(&ctx, &session, &bytes).unwrap(), 2);
        assert_eq!(session.read_bytes(), bytes.len() as u64);
        assert_eq!(ctx.statistics.snapshot().packets_read, 2);
    }

    #[test]
    fn test_datagrams_multiplex_by_convey_id() {
        let events = Arc::new(Recorder::default());
        let ctx = context(events);
        let (tx, _rx) = mpsc::channel(1);
        let remote = SocketAddr::from(([127, 0, 0, 1], 5000));

        let datagram = |convey: i32| {
            let mut inner = DataCollection::new_array();
            inner.push(DataValue::Int(1));
            let DataCollection::Array(items) = inner else {
                unreachable!()
            };
            let mut message = DataCollection::new_map();
            message
                .put(DATAGRAM_CONVEY_ID_KEY, DataValue::Int(convey))
                .put(DATAGRAM_MESSAGE_DATA_KEY, DataValue::Array(items));
            framed(&message, TransportType::Datagram)
        };

        let a = on_datagram(&ctx, &datagram(1), remote, &tx).unwrap();
        let b = on_datagram(&ctx, &datagram(2), remote, &tx).unwrap();
        let again = on_datagram(&ctx, &datagram(1), remote, &tx).unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), again.id());
        assert_eq!(ctx.manager.session_count(), 2);
    }

    #[test]
    fn test_datagram_without_convey_id_is_dropped() {
        let ctx = context(Arc::new(Recorder::default()));
        let (tx, _rx) = mpsc::channel(1);
        let mut message = DataCollection::new_array();
        message.push(DataValue::String("no id".into()));

        let bytes = framed(&message, TransportType::Datagram);
        assert!(on_datagram(&ctx, &bytes, SocketAddr::from(([127, 0, 0, 1], 1)), &tx).is_none());
        assert_eq!(ctx.manager.session_count(), 0);
    }

    #[test]
    fn test_kcp_without_factory_is_refused() {
        let ctx = context(Arc::new(Recorder::default()));
        let (tx, _rx) = mpsc::channel(1);
        let result = on_kcp_segment(&ctx, &[1, 0, 0, 0, 0], SocketAddr::from(([127, 0, 0, 1], 1)), &tx);
        assert!(matches!(result, Err(ProtocolError::IllegalState(_))));
    }
}
