// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Router
//!
//! Decides where each inbound message goes:
//!
//! 1. Append to the message log. A failure is reported and routing continues.
//! 2. Look up the recipient in the connection registry.
//! 3. If online, hand the message to the recipient's session. A session that
//!    is behind gets up to the delivery timeout to make room; the sender's
//!    own session waits meanwhile. Under [`DeliveryPolicy::LiveOnly`] a failed
//!    hand-off is final; under [`DeliveryPolicy::FallbackToQueue`] the
//!    message is queued instead.
//! 4. If offline, append to the recipient's offline queue.
//!
//! The sender never learns the outcome.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::connection_registry::ConnectionRegistry;
use crate::message::{ChatMessage, InboundFrame, UserId};
use crate::message_log::MessageLog;
use crate::metrics::RelayMetrics;
use crate::offline_queue::OfflineQueue;

/// How long a route waits on a recipient whose session buffer is full.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// What to do when a registered recipient's session cannot take a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// A registered recipient gets exactly one live attempt.
    #[default]
    LiveOnly,
    /// Queue the message when the live attempt fails.
    FallbackToQueue,
}

/// Where a routed message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the recipient's live session.
    Delivered,
    /// Stored in the recipient's offline queue.
    Queued,
    /// Only the message log has it, if that append succeeded.
    Lost,
}

/// Shared router, injected into every session.
pub struct MessageRouter {
    log: Arc<dyn MessageLog>,
    queue: Arc<dyn OfflineQueue>,
    registry: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    policy: DeliveryPolicy,
    delivery_timeout: Duration,
    metrics: RelayMetrics,
}

impl MessageRouter {
    pub fn new(
        log: Arc<dyn MessageLog>,
        queue: Arc<dyn OfflineQueue>,
        registry: Arc<ConnectionRegistry>,
        clock: Arc<dyn Clock>,
        policy: DeliveryPolicy,
        metrics: RelayMetrics,
    ) -> Self {
        MessageRouter {
            log,
            queue,
            registry,
            clock,
            policy,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            metrics,
        }
    }

    /// Sets how long a route may wait for a backed-up recipient.
    pub fn with_delivery_timeout(mut self, delivery_timeout: Duration) -> Self {
        self.delivery_timeout = delivery_timeout;
        self
    }

    /// Stamps an inbound frame with its author and arrival time and routes it.
    pub fn route(&self, sender: UserId, frame: InboundFrame) -> RouteOutcome {
        let msg = ChatMessage::from_frame(sender, frame, self.clock.now_secs());
        self.route_message(msg)
    }

    /// Routes an already stamped message.
    pub fn route_message(&self, msg: ChatMessage) -> RouteOutcome {
        let _timer = self.metrics.route_duration.start_timer();
        self.metrics.messages_received.inc();

        if let Err(e) = self.log.append(&msg) {
            self.metrics.log_failures.inc();
            error!(
                "Failed to log message {} -> {}: {}",
                msg.sender, msg.recipient, e
            );
        }

        let recipient = msg.recipient;
        let outcome = match self.registry.lookup(recipient) {
            Some(handle) => match handle.deliver(msg.clone(), self.delivery_timeout) {
                Ok(()) => RouteOutcome::Delivered,
                Err(e) => {
                    warn!(
                        "Live delivery to {} (session {}) failed: {}",
                        recipient,
                        handle.session(),
                        e
                    );
                    match self.policy {
                        DeliveryPolicy::LiveOnly => RouteOutcome::Lost,
                        DeliveryPolicy::FallbackToQueue => self.enqueue(&msg),
                    }
                }
            },
            None => self.enqueue(&msg),
        };

        match outcome {
            RouteOutcome::Delivered => self.metrics.messages_delivered.inc(),
            RouteOutcome::Queued => self.metrics.messages_queued.inc(),
            RouteOutcome::Lost => self.metrics.messages_lost.inc(),
        }
        debug!("Routed message for {}: {:?}", recipient, outcome);

        outcome
    }

    fn enqueue(&self, msg: &ChatMessage) -> RouteOutcome {
        match self.queue.enqueue(msg) {
            Ok(discarded) => {
                self.metrics.offline_pending.inc();
                if discarded > 0 {
                    self.metrics.offline_pending.sub(discarded as i64);
                    self.metrics.offline_expired.inc_by(discarded as u64);
                }
                RouteOutcome::Queued
            }
            Err(e) => {
                self.metrics.queue_failures.inc();
                error!("Failed to queue message for {}: {}", msg.recipient, e);
                RouteOutcome::Lost
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connection_registry::ConnectionHandle;
    use crate::error::StorageError;
    use crate::message_log::MemoryMessageLog;
    use crate::offline_queue::{MemoryOfflineQueue, DEFAULT_OFFLINE_TTL};

    struct FailingLog;

    impl MessageLog for FailingLog {
        fn append(&self, _msg: &ChatMessage) -> Result<i64, StorageError> {
            Err(StorageError::Database(rusqlite::Error::QueryReturnedNoRows))
        }

        fn conversation(
            &self,
            _a: UserId,
            _b: UserId,
            _limit: usize,
        ) -> Result<Vec<ChatMessage>, StorageError> {
            Ok(Vec::new())
        }

        fn count(&self) -> usize {
            0
        }
    }

    struct FailingQueue;

    impl OfflineQueue for FailingQueue {
        fn enqueue(&self, _msg: &ChatMessage) -> Result<usize, StorageError> {
            Err(StorageError::Database(rusqlite::Error::QueryReturnedNoRows))
        }

        fn drain(&self, _recipient: UserId) -> Result<Vec<ChatMessage>, StorageError> {
            Ok(Vec::new())
        }

        fn cleanup_expired(&self) -> usize {
            0
        }

        fn message_count(&self) -> usize {
            0
        }

        fn recipient_count(&self) -> usize {
            0
        }
    }

    struct Fixture {
        router: MessageRouter,
        log: Arc<MemoryMessageLog>,
        queue: Arc<MemoryOfflineQueue>,
        registry: Arc<ConnectionRegistry>,
        clock: Arc<ManualClock>,
        metrics: RelayMetrics,
    }

    fn fixture(policy: DeliveryPolicy) -> Fixture {
        fixture_with_timeout(policy, Duration::from_millis(20))
    }

    fn fixture_with_timeout(policy: DeliveryPolicy, delivery_timeout: Duration) -> Fixture {
        let clock = Arc::new(ManualClock::new(5_000));
        let clock_handle = clock.clone();
        let log = Arc::new(MemoryMessageLog::new());
        let queue = Arc::new(MemoryOfflineQueue::new(DEFAULT_OFFLINE_TTL, clock.clone()));
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = RelayMetrics::new();
        let router = MessageRouter::new(
            log.clone(),
            queue.clone(),
            registry.clone(),
            clock,
            policy,
            metrics.clone(),
        )
        .with_delivery_timeout(delivery_timeout);
        Fixture {
            router,
            log,
            queue,
            registry,
            clock: clock_handle,
            metrics,
        }
    }

    fn frame(to: UserId, content: &str) -> InboundFrame {
        InboundFrame {
            to,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_online_recipient_gets_live_delivery() {
        let f = fixture(DeliveryPolicy::LiveOnly);
        let (handle, mut rx) = ConnectionHandle::channel(8);
        f.registry.register(2, handle);

        assert_eq!(f.router.route(1, frame(2, "hi")), RouteOutcome::Delivered);

        let got = rx.recv().await.unwrap();
        assert_eq!(got.sender, 1);
        assert_eq!(got.content, "hi");
        assert_eq!(got.sent_at, 5_000);
        assert_eq!(f.queue.message_count(), 0);
        assert_eq!(f.log.count(), 1);
    }

    #[test]
    fn test_offline_recipient_is_queued() {
        let f = fixture(DeliveryPolicy::LiveOnly);

        assert_eq!(f.router.route(1, frame(2, "later")), RouteOutcome::Queued);

        let pending = f.queue.drain(2).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "later");
        assert_eq!(f.log.count(), 1);
    }

    #[test]
    fn test_broken_live_handle_is_not_queued_by_default() {
        let f = fixture(DeliveryPolicy::LiveOnly);
        let (handle, rx) = ConnectionHandle::channel(8);
        f.registry.register(2, handle);
        drop(rx);

        assert_eq!(f.router.route(1, frame(2, "gone")), RouteOutcome::Lost);
        assert_eq!(f.queue.message_count(), 0);
        assert_eq!(f.log.count(), 1);
        assert_eq!(f.metrics.messages_lost.get(), 1);
    }

    #[test]
    fn test_broken_live_handle_falls_back_when_enabled() {
        let f = fixture(DeliveryPolicy::FallbackToQueue);
        let (handle, rx) = ConnectionHandle::channel(8);
        f.registry.register(2, handle);
        drop(rx);

        assert_eq!(f.router.route(1, frame(2, "saved")), RouteOutcome::Queued);
        assert_eq!(f.queue.drain(2).unwrap()[0].content, "saved");
        assert_eq!(f.log.count(), 1);
    }

    #[test]
    fn test_full_live_handle_falls_back_when_enabled() {
        let f = fixture(DeliveryPolicy::FallbackToQueue);
        let (handle, _rx) = ConnectionHandle::channel(1);
        f.registry.register(2, handle);

        assert_eq!(f.router.route(1, frame(2, "one")), RouteOutcome::Delivered);
        assert_eq!(f.router.route(1, frame(2, "two")), RouteOutcome::Queued);
    }

    #[test]
    fn test_full_live_handle_is_lost_after_timeout_by_default() {
        let f = fixture(DeliveryPolicy::LiveOnly);
        let (handle, _rx) = ConnectionHandle::channel(1);
        f.registry.register(2, handle);

        assert_eq!(f.router.route(1, frame(2, "one")), RouteOutcome::Delivered);
        assert_eq!(f.router.route(1, frame(2, "two")), RouteOutcome::Lost);
        assert_eq!(f.queue.message_count(), 0);
    }

    #[test]
    fn test_backed_up_recipient_is_waited_for() {
        let f = fixture_with_timeout(DeliveryPolicy::LiveOnly, Duration::from_secs(5));
        let (handle, mut rx) = ConnectionHandle::channel(2);
        f.registry.register(2, handle);

        let reader = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            (0..10)
                .map(|_| rx.blocking_recv().unwrap().content)
                .collect::<Vec<_>>()
        });

        for i in 0..10 {
            assert_eq!(
                f.router.route(1, frame(2, &format!("m{}", i))),
                RouteOutcome::Delivered
            );
        }

        let expected: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
        assert_eq!(reader.join().unwrap(), expected);
        assert_eq!(f.metrics.messages_lost.get(), 0);
        assert_eq!(f.metrics.messages_delivered.get(), 10);
    }

    #[test]
    fn test_pending_gauge_tracks_expired_discards() {
        let f = fixture(DeliveryPolicy::LiveOnly);

        f.router.route(1, frame(2, "old-a"));
        f.router.route(1, frame(2, "old-b"));
        assert_eq!(f.metrics.offline_pending.get(), 2);

        f.clock.advance(DEFAULT_OFFLINE_TTL.as_secs() + 1);
        f.router.route(1, frame(2, "fresh"));

        assert_eq!(f.metrics.offline_pending.get(), 1);
        assert_eq!(f.metrics.offline_expired.get(), 2);
        assert_eq!(f.metrics.offline_pending.get() as usize, f.queue.message_count());
    }

    #[test]
    fn test_every_route_logs_exactly_once() {
        let f = fixture(DeliveryPolicy::LiveOnly);

        f.router.route(1, frame(2, "offline"));

        let (live, _rx) = ConnectionHandle::channel(8);
        f.registry.register(3, live);
        f.router.route(1, frame(3, "online"));

        let (broken, rx) = ConnectionHandle::channel(8);
        f.registry.register(4, broken);
        drop(rx);
        f.router.route(1, frame(4, "broken"));

        assert_eq!(f.log.count(), 3);
        assert_eq!(f.log.conversation(1, 2, 10).unwrap().len(), 1);
        assert_eq!(f.log.conversation(1, 3, 10).unwrap().len(), 1);
        assert_eq!(f.log.conversation(1, 4, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_log_failure_does_not_block_delivery() {
        let clock = Arc::new(ManualClock::new(1));
        let queue = Arc::new(MemoryOfflineQueue::new(DEFAULT_OFFLINE_TTL, clock.clone()));
        let metrics = RelayMetrics::new();
        let router = MessageRouter::new(
            Arc::new(FailingLog),
            queue.clone(),
            Arc::new(ConnectionRegistry::new()),
            clock,
            DeliveryPolicy::LiveOnly,
            metrics.clone(),
        );

        assert_eq!(router.route(1, frame(2, "x")), RouteOutcome::Queued);
        assert_eq!(queue.message_count(), 1);
        assert_eq!(metrics.log_failures.get(), 1);
    }

    #[test]
    fn test_queue_failure_keeps_log_row() {
        let clock = Arc::new(ManualClock::new(1));
        let log = Arc::new(MemoryMessageLog::new());
        let metrics = RelayMetrics::new();
        let router = MessageRouter::new(
            log.clone(),
            Arc::new(FailingQueue),
            Arc::new(ConnectionRegistry::new()),
            clock,
            DeliveryPolicy::LiveOnly,
            metrics.clone(),
        );

        assert_eq!(router.route(1, frame(2, "x")), RouteOutcome::Lost);
        assert_eq!(log.count(), 1);
        assert_eq!(metrics.queue_failures.get(), 1);
    }
}
