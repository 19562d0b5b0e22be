//! WebSocket Accept Loop
//!
//! Accepts TCP connections, enforces the connection limit, authenticates the
//! upgrade request and spawns one session task per connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use crate::auth::{token_from_request, Authenticator};
use crate::connection_limit::{ConnectionGuard, ConnectionLimiter};
use crate::error::AuthError;
use crate::handler::{self, SessionDeps};
use crate::message::UserId;

/// Everything the accept loop needs.
pub struct ServerState {
    pub session: SessionDeps,
    pub authenticator: Arc<dyn Authenticator>,
    pub limiter: ConnectionLimiter,
    pub handshake_timeout: Duration,
}

fn unauthorized(reason: &AuthError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Accepts connections until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: ServerState, shutdown: F)
where
    F: Future<Output = ()>,
{
    let state = Arc::new(state);
    tokio::pin!(shutdown);

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
            _ = &mut shutdown => {
                info!("Shutting down: no longer accepting connections");
                break;
            }
        };

        let guard = match state.limiter.try_acquire() {
            Some(guard) => guard,
            None => {
                warn!(
                    "Connection rejected: at max capacity ({}/{})",
                    state.limiter.active_count(),
                    state.limiter.max_connections()
                );
                state.session.metrics.connection_errors.inc();
                drop(stream);
                continue;
            }
        };

        tokio::spawn(accept_connection(stream, state.clone(), guard));
    }
}

async fn accept_connection(stream: TcpStream, state: Arc<ServerState>, guard: ConnectionGuard) {
    // Held until the session ends
    let _guard = guard;

    let mut identity: Option<UserId> = None;
    let callback = |request: &Request, response: Response| {
        let user = token_from_request(request)
            .ok_or(AuthError::MissingToken)
            .and_then(|token| state.authenticator.authenticate(&token));
        match user {
            Ok(user) => {
                identity = Some(user);
                Ok(response)
            }
            Err(e) => {
                warn!("Rejected upgrade: {}", e);
                Err(unauthorized(&e))
            }
        }
    };

    let upgraded = timeout(state.handshake_timeout, accept_hdr_async(stream, callback)).await;
    match (upgraded, identity) {
        (Ok(Ok(ws_stream)), Some(user)) => {
            debug!("New WebSocket session");
            handler::handle_connection(ws_stream, user, state.session.clone()).await;
            debug!("WebSocket session closed");
        }
        (Ok(Ok(_)), None) => {
            error!("Upgrade completed without an identity");
            state.session.metrics.connection_errors.inc();
        }
        (Ok(Err(e)), _) => {
            debug!("WebSocket handshake failed: {}", e);
            state.session.metrics.connection_errors.inc();
        }
        (Err(_), _) => {
            warn!("WebSocket handshake timeout");
            state.session.metrics.connection_errors.inc();
        }
    }
}
