// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Session Handler
//!
//! Runs one authenticated connection from registration to teardown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

use crate::connection_registry::{ConnectionHandle, ConnectionRegistry};
use crate::message::{self, ChatMessage, UserId};
use crate::metrics::RelayMetrics;
use crate::offline_queue::OfflineQueue;
use crate::router::MessageRouter;

/// Shared dependencies for handling a WebSocket session.
#[derive(Clone)]
pub struct SessionDeps {
    pub router: Arc<MessageRouter>,
    pub registry: Arc<ConnectionRegistry>,
    pub queue: Arc<dyn OfflineQueue>,
    pub metrics: RelayMetrics,
    pub max_message_size: usize,
    /// `None` leaves dead-connection detection to the transport.
    pub idle_timeout: Option<Duration>,
    /// Capacity of the session's outbound buffer.
    pub session_buffer: usize,
}

enum Inbound {
    Frame(Message),
    Ended,
    Failed(WsError),
    Idle,
}

async fn next_inbound<S>(read: &mut S, idle_timeout: Option<Duration>) -> Inbound
where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    let next = match idle_timeout {
        Some(limit) => match timeout(limit, read.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::Idle,
        },
        None => read.next().await,
    };
    match next {
        Some(Ok(msg)) => Inbound::Frame(msg),
        Some(Err(e)) => Inbound::Failed(e),
        None => Inbound::Ended,
    }
}

async fn send_message<W>(write: &mut W, msg: &ChatMessage) -> Result<(), WsError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    match msg.to_json() {
        Ok(text) => write.send(Message::Text(text)).await,
        Err(e) => {
            error!("Failed to encode message for {}: {}", msg.recipient, e);
            Ok(())
        }
    }
}

/// Handles a WebSocket connection for an already authenticated user.
pub async fn handle_connection<S>(ws_stream: WebSocketStream<S>, user_id: UserId, deps: SessionDeps)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let SessionDeps {
        router,
        registry,
        queue,
        metrics,
        max_message_size,
        idle_timeout,
        session_buffer,
    } = deps;
    // Random label for log lines; user ids stay out of session logs.
    let session_label = uuid::Uuid::new_v4().simple().to_string();
    let label = &session_label[..8];

    let (mut write, mut read) = ws_stream.split();

    let (handle, mut outbound) = ConnectionHandle::channel(session_buffer);
    let session = handle.session();
    if let Some(previous) = registry.register(user_id, handle) {
        debug!("[{}] Superseded session {}", label, previous);
    }
    metrics.connections_total.inc();
    metrics.connections_active.inc();
    debug!("[{}] Session {} active", label, session);

    // Deliver the offline backlog before anything that arrives live. Live
    // messages routed meanwhile wait in `outbound`.
    let drained = {
        let queue = queue.clone();
        tokio::task::spawn_blocking(move || {
            let drained = queue.drain(user_id);
            (drained, queue.message_count())
        })
        .await
    };
    let mut backlog_ok = true;
    match drained {
        Ok((Ok(pending), remaining)) => {
            // Expired entries drain as nothing, so resync from the store.
            metrics.offline_pending.set(remaining as i64);
            let total = pending.len();
            for (sent, msg) in pending.iter().enumerate() {
                if let Err(e) = send_message(&mut write, msg).await {
                    warn!(
                        "[{}] Failed to send offline backlog ({} of {} undelivered): {}",
                        label,
                        total - sent,
                        total,
                        e
                    );
                    backlog_ok = false;
                    break;
                }
                metrics.offline_drained.inc();
            }
            if backlog_ok && total > 0 {
                debug!("[{}] Sent {} offline messages", label, total);
            }
        }
        Ok((Err(e), _)) => {
            metrics.queue_failures.inc();
            error!("[{}] Failed to drain offline queue: {}", label, e);
        }
        Err(e) => {
            error!("[{}] Offline drain task failed: {}", label, e);
        }
    }

    while backlog_ok {
        tokio::select! {
            inbound = next_inbound(&mut read, idle_timeout) => {
                let data = match inbound {
                    Inbound::Frame(Message::Text(text)) => text.into_bytes(),
                    Inbound::Frame(Message::Binary(data)) => data,
                    Inbound::Frame(Message::Ping(data)) => {
                        let _ = write.send(Message::Pong(data)).await;
                        continue;
                    }
                    Inbound::Frame(Message::Close(_)) => {
                        debug!("[{}] Client sent close", label);
                        break;
                    }
                    Inbound::Frame(_) => continue,
                    Inbound::Ended => {
                        debug!("[{}] Disconnected", label);
                        break;
                    }
                    Inbound::Failed(e) => {
                        warn!("[{}] Connection error: {}", label, e);
                        break;
                    }
                    Inbound::Idle => {
                        warn!("[{}] Idle timeout", label);
                        break;
                    }
                };

                if data.len() > max_message_size {
                    warn!("[{}] Message too large: {} bytes", label, data.len());
                    metrics.messages_rejected.inc();
                    continue;
                }

                let frame = match message::decode_frame(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("[{}] Discarding frame: {}", label, e);
                        metrics.messages_rejected.inc();
                        continue;
                    }
                };

                let router = router.clone();
                if let Err(e) =
                    tokio::task::spawn_blocking(move || router.route(user_id, frame)).await
                {
                    error!("[{}] Routing task failed: {}", label, e);
                }
            }
            delivery = outbound.recv() => {
                match delivery {
                    Some(msg) => {
                        if let Err(e) = send_message(&mut write, &msg).await {
                            warn!("[{}] Failed to write live message: {}", label, e);
                            break;
                        }
                    }
                    None => {
                        // The registry dropped our sender: a newer session owns this user.
                        debug!("[{}] Superseded by a newer session", label);
                        metrics.sessions_superseded.inc();
                        break;
                    }
                }
            }
        }
    }

    registry.deregister(user_id, session);
    metrics.connections_active.dec();
    let _ = write.close().await;
    debug!("[{}] Session {} closed", label, session);
}
