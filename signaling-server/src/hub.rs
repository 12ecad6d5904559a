//! Subscription hub: fans each appended [`mailbox::Message`] out to the
//! WebSocket connections currently subscribed to that mailbox.
//!
//! Each subscriber gets its own bounded `mpsc` channel. A subscriber that
//! can't keep up is evicted rather than allowed to stall every other
//! peer's delivery — `publish` never blocks on a slow reader.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::mailbox::Message;

struct Subscriber {
    client_id: Uuid,
    tx: mpsc::Sender<Message>,
}

/// Why the hub ended a subscription on its own initiative, as opposed to
/// the client disconnecting or unsubscribing. Maps onto the WebSocket
/// close codes the hub can report (4000/4001); `1000` (normal) has no
/// variant here since it needs no explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The mailbox was deleted or TTL-reaped out from under the socket.
    MailboxClosed,
    /// The subscriber's outbound channel was full; the hub evicts rather
    /// than let one slow reader stall fan-out for everyone else.
    SlowConsumer,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::MailboxClosed => 4000,
            CloseReason::SlowConsumer => 4001,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::MailboxClosed => "mailbox_closed",
            CloseReason::SlowConsumer => "slow_consumer",
        }
    }
}

#[derive(Default)]
pub struct Hub {
    subscribers: Mutex<HashMap<Uuid, Vec<Subscriber>>>,
    /// Set when a subscriber is dropped for a reason the socket task needs
    /// to relay as a close code, consumed once by `take_close_reason`.
    close_reasons: Mutex<HashMap<(Uuid, Uuid), CloseReason>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("too many subscribers for this mailbox")]
    TooManySubscribers,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its receive half. Replaces any
    /// existing subscription for the same `(mailbox_id, client_id)` pair —
    /// a reconnect supersedes the stale socket rather than stacking on it.
    ///
    /// This only wires up live fan-out. The hub has no `MailboxStore`
    /// handle to snapshot from, so the caller (`router::ws_upgrade` /
    /// `push_mailbox_updates`) is responsible for reading the backlog via
    /// `MailboxStore::read_since` and pushing it before trusting anything
    /// off the returned receiver — that ordering is what makes this
    /// subscription a resumable stream instead of "messages from now on".
    pub fn subscribe(
        &self,
        mailbox_id: Uuid,
        client_id: Uuid,
        channel_capacity: usize,
        max_subscribers: usize,
    ) -> Result<mpsc::Receiver<Message>, SubscribeError> {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let mut subscribers = self.subscribers.lock();
        let entry = subscribers.entry(mailbox_id).or_default();
        entry.retain(|s| s.client_id != client_id);
        if entry.len() >= max_subscribers {
            return Err(SubscribeError::TooManySubscribers);
        }
        entry.push(Subscriber { client_id, tx });
        // A fresh subscribe shouldn't inherit a reason left over from a
        // previous connection for the same (mailbox, client) pair.
        self.close_reasons.lock().remove(&(mailbox_id, client_id));
        Ok(rx)
    }

    pub fn unsubscribe(&self, mailbox_id: Uuid, client_id: Uuid) {
        let mut subscribers = self.subscribers.lock();
        if let Some(entry) = subscribers.get_mut(&mailbox_id) {
            entry.retain(|s| s.client_id != client_id);
            if entry.is_empty() {
                subscribers.remove(&mailbox_id);
            }
        }
        self.close_reasons.lock().remove(&(mailbox_id, client_id));
    }

    /// Fan `message` out to every live subscriber of `mailbox_id`. Returns
    /// the client ids evicted for falling behind, so callers can log them.
    pub fn publish(&self, mailbox_id: Uuid, message: Message) -> Vec<Uuid> {
        let mut evicted = Vec::new();
        let mut subscribers = self.subscribers.lock();
        if let Some(entry) = subscribers.get_mut(&mailbox_id) {
            entry.retain(|s| match s.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.close_reasons
                        .lock()
                        .insert((mailbox_id, s.client_id), CloseReason::SlowConsumer);
                    evicted.push(s.client_id);
                    false
                }
                // Receiver already dropped (client disconnected on its own);
                // nothing for it to learn, no reason to record.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if entry.is_empty() {
                subscribers.remove(&mailbox_id);
            }
        }
        evicted
    }

    pub fn drop_mailbox(&self, mailbox_id: Uuid) {
        if let Some(entry) = self.subscribers.lock().remove(&mailbox_id) {
            let mut close_reasons = self.close_reasons.lock();
            for subscriber in entry {
                close_reasons.insert((mailbox_id, subscriber.client_id), CloseReason::MailboxClosed);
            }
        }
    }

    /// Consume the recorded reason (if any) a subscriber's channel was
    /// closed by the hub, for the socket task to relay as a WS close code.
    pub fn take_close_reason(&self, mailbox_id: Uuid, client_id: Uuid) -> Option<CloseReason> {
        self.close_reasons.lock().remove(&(mailbox_id, client_id))
    }

    /// Mailbox ids with at least one live subscriber, for the reaper to
    /// cross-check against the backing store.
    pub fn active_mailboxes(&self) -> Vec<Uuid> {
        self.subscribers.lock().keys().copied().collect()
    }

    pub fn subscriber_count(&self, mailbox_id: Uuid) -> usize {
        self.subscribers
            .lock()
            .get(&mailbox_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Live subscribers summed across every mailbox, for `/health`.
    pub fn total_subscribers(&self) -> usize {
        self.subscribers.lock().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(seq: u64) -> Message {
        Message {
            seq,
            from_mailbox_id: Uuid::new_v4(),
            ciphertext_b64: "ct".into(),
            created_at_epoch_ms: 0,
        }
    }

    #[test]
    fn publish_delivers_to_all_subscribers() {
        let hub = Hub::new();
        let mailbox_id = Uuid::new_v4();
        let mut a = hub.subscribe(mailbox_id, Uuid::new_v4(), 4, 4).unwrap();
        let mut b = hub.subscribe(mailbox_id, Uuid::new_v4(), 4, 4).unwrap();

        hub.publish(mailbox_id, message(1));
        assert_eq!(a.try_recv().unwrap().seq, 1);
        assert_eq!(b.try_recv().unwrap().seq, 1);
    }

    #[test]
    fn too_many_subscribers_is_rejected() {
        let hub = Hub::new();
        let mailbox_id = Uuid::new_v4();
        hub.subscribe(mailbox_id, Uuid::new_v4(), 4, 1).unwrap();
        let err = hub.subscribe(mailbox_id, Uuid::new_v4(), 4, 1).unwrap_err();
        assert_eq!(err, SubscribeError::TooManySubscribers);
    }

    #[test]
    fn resubscribing_same_client_replaces_the_old_channel() {
        let hub = Hub::new();
        let mailbox_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        let mut first = hub.subscribe(mailbox_id, client_id, 4, 4).unwrap();
        let mut second = hub.subscribe(mailbox_id, client_id, 4, 4).unwrap();

        hub.publish(mailbox_id, message(1));
        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv().unwrap().seq, 1);
    }

    #[test]
    fn slow_subscriber_is_evicted_without_blocking_others() {
        let hub = Hub::new();
        let mailbox_id = Uuid::new_v4();
        let slow_id = Uuid::new_v4();
        let mut slow = hub.subscribe(mailbox_id, slow_id, 1, 4).unwrap();
        let mut fast = hub.subscribe(mailbox_id, Uuid::new_v4(), 4, 4).unwrap();

        // `slow`'s channel has capacity 1: the first publish fills its
        // single buffer slot, so the second is the one that finds it full
        // and evicts it — a third publish would just find `slow` already
        // gone.
        hub.publish(mailbox_id, message(1));
        let evicted = hub.publish(mailbox_id, message(2));

        assert_eq!(evicted, vec![slow_id]);
        assert_eq!(hub.subscriber_count(mailbox_id), 1);
        assert!(slow.try_recv().is_ok());
        assert_eq!(fast.try_recv().unwrap().seq, 1);
    }

    #[test]
    fn unsubscribe_removes_the_empty_mailbox_entry() {
        let hub = Hub::new();
        let mailbox_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        hub.subscribe(mailbox_id, client_id, 4, 4).unwrap();
        hub.unsubscribe(mailbox_id, client_id);
        assert_eq!(hub.subscriber_count(mailbox_id), 0);
    }

    #[test]
    fn slow_consumer_eviction_records_a_close_reason() {
        let hub = Hub::new();
        let mailbox_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        let _rx = hub.subscribe(mailbox_id, client_id, 1, 4).unwrap();

        hub.publish(mailbox_id, message(1));
        hub.publish(mailbox_id, message(2));

        assert_eq!(
            hub.take_close_reason(mailbox_id, client_id),
            Some(CloseReason::SlowConsumer)
        );
        // Consumed, not sticky.
        assert_eq!(hub.take_close_reason(mailbox_id, client_id), None);
    }

    #[test]
    fn drop_mailbox_records_mailbox_closed_for_every_subscriber() {
        let hub = Hub::new();
        let mailbox_id = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        hub.subscribe(mailbox_id, a, 4, 4).unwrap();
        hub.subscribe(mailbox_id, b, 4, 4).unwrap();

        hub.drop_mailbox(mailbox_id);

        assert_eq!(hub.take_close_reason(mailbox_id, a), Some(CloseReason::MailboxClosed));
        assert_eq!(hub.take_close_reason(mailbox_id, b), Some(CloseReason::MailboxClosed));
        assert_eq!(hub.subscriber_count(mailbox_id), 0);
    }

    #[test]
    fn resubscribe_clears_a_stale_close_reason() {
        let hub = Hub::new();
        let mailbox_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        let _first = hub.subscribe(mailbox_id, client_id, 1, 4).unwrap();
        hub.publish(mailbox_id, message(1));
        hub.publish(mailbox_id, message(2));
        assert!(hub.take_close_reason(mailbox_id, client_id).is_some());

        let _second = hub.subscribe(mailbox_id, client_id, 4, 4).unwrap();
        assert_eq!(hub.take_close_reason(mailbox_id, client_id), None);
    }
}
