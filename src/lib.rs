// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Real-time chat relay: live WebSocket delivery, offline queues with a
//! retention window, and a persistent message log.

pub mod auth;
pub mod clock;
pub mod config;
pub mod connection_limit;
pub mod connection_registry;
pub mod error;
pub mod handler;
pub mod http;
pub mod message;
pub mod message_log;
pub mod metrics;
pub mod offline_queue;
pub mod router;
pub mod server;
pub mod storage;
