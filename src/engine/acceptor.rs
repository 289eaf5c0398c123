//! # Acceptor
//!
//! Accept loops for the stream transports. Each accepted connection is
//! registered with the session manager and gets two tasks: a read loop and a
//! writer that drains the session's outbound channel into the connection.
//!
//! A peer refused by the connection filter is dropped right away. A session
//! that comes back already closed (over the global limit) gets no tasks.

use crate::core::codec::PacketCodec;
use crate::engine::reader::{read_socket, read_websocket};
use crate::engine::{EngineContext, CONNECTION_OUTBOUND_CAPACITY};
use crate::error::ProtocolError;
use crate::session::{DisconnectCause, Session};
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, instrument, warn};

/// Time a client gets to complete the websocket upgrade.
pub const WEBSOCKET_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept raw socket connections until the engine is cancelled.
#[instrument(skip(ctx, listener), fields(local = ?listener.local_addr().ok()))]
pub async fn accept_sockets(ctx: Arc<EngineContext>, listener: TcpListener) {
    info!("Accepting socket connections");
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => start_socket(&ctx, stream, peer),
            Err(e) => warn!(error = %e, "Error accepting connection"),
        }
    }
    info!("Socket acceptor stopped");
}

fn start_socket(ctx: &Arc<EngineContext>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let (outbound, rx) = mpsc::channel(CONNECTION_OUTBOUND_CAPACITY);
    let session = match ctx
        .manager
        .create_socket_session(ctx.next_channel_id(), peer, outbound)
    {
        Ok(session) if !session.is_closed() => session,
        Ok(_) => return,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Connection refused");
            return;
        }
    };

    let (read_half, write_half) = stream.into_split();
    let sink = FramedWrite::new(write_half, PacketCodec::default());
    ctx.tasks.spawn(write_connection(ctx.clone(), session.clone(), sink, rx, std::convert::identity));
    ctx.tasks.spawn(read_socket(ctx.clone(), session, read_half));
}

/// Accept websocket connections until the engine is cancelled.
#[instrument(skip(ctx, listener), fields(local = ?listener.local_addr().ok()))]
pub async fn accept_websockets(ctx: Arc<EngineContext>, listener: TcpListener) {
    info!("Accepting websocket connections");
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                ctx.tasks.spawn(start_websocket(ctx.clone(), stream, peer));
            }
            Err(e) => warn!(error = %e, "Error accepting connection"),
        }
    }
    info!("Websocket acceptor stopped");
}

async fn start_websocket(ctx: Arc<EngineContext>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let upgraded = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        upgraded = tokio::time::timeout(
            WEBSOCKET_HANDSHAKE_TIMEOUT,
            tokio_tungstenite::accept_async(stream),
        ) => upgraded,
    };
    let websocket = match upgraded {
        Ok(Ok(websocket)) => websocket,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "Websocket handshake failed");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "Websocket handshake timed out");
            return;
        }
    };

    let (outbound, rx) = mpsc::channel(CONNECTION_OUTBOUND_CAPACITY);
    let session = match ctx
        .manager
        .create_websocket_session(ctx.next_channel_id(), peer, outbound)
    {
        Ok(session) if !session.is_closed() => session,
        Ok(_) => return,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Connection refused");
            return;
        }
    };

    let (sink, stream) = websocket.split();
    let sink = sink.sink_map_err(|e| ProtocolError::WebSocket(e.to_string()));
    ctx.tasks.spawn(write_connection(
        ctx.clone(),
        session.clone(),
        sink,
        rx,
        |bytes: Bytes| Message::Binary(bytes.to_vec()),
    ));
    read_websocket(ctx, session, stream).await;
}

/// Forward a session's outbound bytes into its connection sink.
///
/// A failed write closes the session with `LostInWritten`. The sink is closed
/// when the session closes, which shuts the connection down.
async fn write_connection<S, T, F>(
    ctx: Arc<EngineContext>,
    session: Arc<Session>,
    mut sink: S,
    mut outbound: mpsc::Receiver<Bytes>,
    wrap: F,
) where
    S: Sink<T, Error = ProtocolError> + Unpin,
    F: Fn(Bytes) -> T,
{
    loop {
        let next = tokio::select! {
            _ = session.cancellation().cancelled() => break,
            next = outbound.recv() => next,
        };
        let Some(bytes) = next else {
            break;
        };

        if let Err(e) = sink.send(wrap(bytes)).await {
            ctx.statistics.write_error();
            debug!(session_id = session.id(), error = %e, "Connection write failed");
            ctx.manager
                .close_session(&session, DisconnectCause::LostInWritten);
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(session_id = session.id(), error = %e, "Connection close failed");
    }
}
