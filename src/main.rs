// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chat Relay Server
//!
//! Provides:
//! - WebSocket endpoint for authenticated real-time messaging
//! - Offline queues for recipients who are not connected
//! - A persistent log of every routed message
//! - HTTP endpoints for health checks and Prometheus metrics

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use chat_relay::auth::{Authenticator, Hs256Authenticator};
use chat_relay::clock::{Clock, SystemClock};
use chat_relay::config::RelayConfig;
use chat_relay::connection_limit::ConnectionLimiter;
use chat_relay::connection_registry::ConnectionRegistry;
use chat_relay::handler::SessionDeps;
use chat_relay::http::{create_router, HttpState};
use chat_relay::message_log::{create_message_log, MessageLog};
use chat_relay::metrics::RelayMetrics;
use chat_relay::offline_queue::{create_offline_queue, OfflineQueue};
use chat_relay::router::MessageRouter;
use chat_relay::server::{self, ServerState};

#[tokio::main]
async fn main() {
    // Initialize logging
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "chat_relay=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration
    let config = RelayConfig::from_env();

    let Some(jwt_secret) = config.jwt_secret.clone() else {
        error!("RELAY_JWT_SECRET is not set; refusing to start without a token secret");
        std::process::exit(1);
    };

    info!("Starting Chat Relay Server v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: {}", config.listen_addr);
    info!("Metrics endpoint: {}", config.metrics_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Offline retention: {}s", config.offline_ttl_secs);
    info!("Delivery policy: {:?}", config.delivery_policy());

    let metrics = RelayMetrics::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let queue: Arc<dyn OfflineQueue> = match create_offline_queue(
        config.storage_backend,
        Some(&config.data_dir),
        config.offline_ttl(),
        clock.clone(),
    ) {
        Ok(queue) => Arc::from(queue),
        Err(e) => {
            error!("Failed to open offline queue: {}", e);
            std::process::exit(1);
        }
    };

    let log: Arc<dyn MessageLog> =
        match create_message_log(config.storage_backend, Some(&config.data_dir)) {
            Ok(log) => Arc::from(log),
            Err(e) => {
                error!("Failed to open message log: {}", e);
                std::process::exit(1);
            }
        };

    let registry = Arc::new(ConnectionRegistry::new());
    let router = Arc::new(MessageRouter::new(
        log,
        queue.clone(),
        registry.clone(),
        clock.clone(),
        config.delivery_policy(),
        metrics.clone(),
    )
    .with_delivery_timeout(config.delivery_timeout()));
    metrics.offline_pending.set(queue.message_count() as i64);

    // Start HTTP server for health/metrics
    let http_state = HttpState {
        metrics: metrics.clone(),
        metrics_token: config.metrics_token.clone(),
        registry: registry.clone(),
        queue: queue.clone(),
    };
    let http_router = create_router(http_state);
    let http_listener = match TcpListener::bind(config.metrics_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind HTTP listener on {}: {}", config.metrics_addr, e);
            std::process::exit(1);
        }
    };
    let http_addr = config.metrics_addr;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server stopped: {}", e);
        }
    });

    // Start cleanup task for expired offline queues
    let cleanup_queue = queue.clone();
    let cleanup_metrics = metrics.clone();
    let cleanup_interval = config.cleanup_interval();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(cleanup_interval).await;
            let queue = cleanup_queue.clone();
            let swept = tokio::task::spawn_blocking(move || {
                let removed = queue.cleanup_expired();
                (removed, queue.message_count())
            })
            .await;
            match swept {
                Ok((removed, pending)) => {
                    if removed > 0 {
                        info!("Cleaned up {} expired offline messages", removed);
                        cleanup_metrics.offline_expired.inc_by(removed as u64);
                    }
                    cleanup_metrics.offline_pending.set(pending as i64);
                }
                Err(e) => error!("Offline cleanup task failed: {}", e),
            }
        }
    });

    let authenticator: Arc<dyn Authenticator> =
        Arc::new(Hs256Authenticator::new(jwt_secret.as_bytes(), clock));
    let state = ServerState {
        session: SessionDeps {
            router,
            registry,
            queue,
            metrics,
            max_message_size: config.max_message_size,
            idle_timeout: config.idle_timeout(),
            session_buffer: config.session_buffer,
        },
        authenticator,
        limiter: ConnectionLimiter::new(config.max_connections),
        handshake_timeout: config.handshake_timeout(),
    };

    // Start TCP listener for WebSocket
    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind WebSocket listener on {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };
    info!("WebSocket server listening on {}", config.listen_addr);

    server::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await;

    info!("Relay stopped");
}
