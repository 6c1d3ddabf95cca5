//! Balance notification hub.
//!
//! Fans committed balance changes out to every live subscriber of the
//! affected user. Delivery is best effort: a full subscriber buffer drops
//! the update for that subscriber and the caller never waits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ledgerline_common::{format_minor, AccountId, Currency, UserId};
use ledgerline_ledger::Account;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::metrics::EngineMetrics;

/// Push message sent for every account an operation changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub account_id: AccountId,
    /// Decimal text with two fractional digits.
    pub balance: String,
    pub currency: Currency,
}

impl From<&Account> for BalanceUpdate {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.id,
            balance: format_minor(account.balance),
            currency: account.currency.clone(),
        }
    }
}

/// Sink for post-commit balance changes.
pub trait BalanceNotifier: Send + Sync {
    /// Never blocks and never fails the caller.
    fn broadcast_balance(&self, user_id: UserId, update: &BalanceUpdate);
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl BalanceNotifier for NoopNotifier {
    fn broadcast_balance(&self, _user_id: UserId, _update: &BalanceUpdate) {}
}

/// A registered subscriber's end of the hub.
#[derive(Debug)]
pub struct Subscription {
    pub user_id: UserId,
    pub subscriber_id: u64,
    /// Serialized [`BalanceUpdate`] messages.
    pub receiver: mpsc::Receiver<Arc<str>>,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub queued: u64,
    pub dropped: u64,
}

type Subscribers = HashMap<UserId, HashMap<u64, mpsc::Sender<Arc<str>>>>;

/// Registry of live subscribers per user.
pub struct BalanceHub {
    subscribers: RwLock<Subscribers>,
    next_id: AtomicU64,
    buffer: usize,
    metrics: Option<Arc<EngineMetrics>>,
}

impl BalanceHub {
    /// Create a hub whose subscribers each queue up to `buffer` messages.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a new subscriber connection for `user_id`.
    pub fn register(&self, user_id: UserId) -> Subscription {
        let subscriber_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers
            .write()
            .entry(user_id)
            .or_default()
            .insert(subscriber_id, tx);

        info!(user_id = %user_id, subscriber_id, "Subscriber registered");
        Subscription {
            user_id,
            subscriber_id,
            receiver: rx,
        }
    }

    /// Unregister a subscriber. Unknown ids are ignored.
    pub fn unregister(&self, user_id: UserId, subscriber_id: u64) {
        let mut subscribers = self.subscribers.write();
        if let Some(connections) = subscribers.get_mut(&user_id) {
            if connections.remove(&subscriber_id).is_some() {
                info!(user_id = %user_id, subscriber_id, "Subscriber unregistered");
            }
            if connections.is_empty() {
                subscribers.remove(&user_id);
            }
        }
    }

    pub fn subscriber_count(&self, user_id: UserId) -> usize {
        self.subscribers
            .read()
            .get(&user_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn user_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Serialize `update` once and queue it for every subscriber of `user_id`.
    pub fn broadcast(&self, user_id: UserId, update: &BalanceUpdate) -> Delivery {
        let message: Arc<str> = match serde_json::to_string(update) {
            Ok(json) => json.into(),
            Err(e) => {
                debug!(error = %e, "Failed to serialize balance update");
                return Delivery::default();
            }
        };

        let mut delivery = Delivery::default();
        let subscribers = self.subscribers.read();
        if let Some(connections) = subscribers.get(&user_id) {
            for (subscriber_id, sender) in connections {
                match sender.try_send(message.clone()) {
                    Ok(()) => delivery.queued += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        delivery.dropped += 1;
                        debug!(
                            user_id = %user_id,
                            subscriber_id,
                            account_id = %update.account_id,
                            "Subscriber buffer full, dropping balance update"
                        );
                    }
                    // connection is shutting down and will unregister itself
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        drop(subscribers);

        if let Some(metrics) = &self.metrics {
            metrics.notifications(delivery.queued, delivery.dropped);
        }
        delivery
    }
}

impl BalanceNotifier for BalanceHub {
    fn broadcast_balance(&self, user_id: UserId, update: &BalanceUpdate) {
        self.broadcast(user_id, update);
    }
}

impl Default for BalanceHub {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(balance: i64) -> BalanceUpdate {
        BalanceUpdate {
            account_id: AccountId::new(),
            balance: format_minor(balance),
            currency: Currency::usd(),
        }
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let hub = BalanceHub::new(10);
        let user = UserId::new();

        let first = hub.register(user);
        let second = hub.register(user);
        assert_ne!(first.subscriber_id, second.subscriber_id);
        assert_eq!(hub.subscriber_count(user), 2);

        hub.unregister(user, first.subscriber_id);
        assert_eq!(hub.subscriber_count(user), 1);
        hub.unregister(user, second.subscriber_id);
        assert_eq!(hub.user_count(), 0);

        // unknown ids are harmless
        hub.unregister(user, 999);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_that_user() {
        let hub = BalanceHub::new(10);
        let alice = UserId::new();
        let bob = UserId::new();
        let mut alice_sub = hub.register(alice);
        let mut bob_sub = hub.register(bob);

        let message = update(900_050);
        let delivery = hub.broadcast(alice, &message);
        assert_eq!(delivery, Delivery { queued: 1, dropped: 0 });

        let raw = alice_sub.receiver.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["balance"], "9000.50");
        assert_eq!(json["currency"], "USD");
        assert_eq!(json["account_id"], message.account_id.to_string());
        assert!(bob_sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_buffer_drops_without_blocking() {
        let metrics = Arc::new(EngineMetrics::new());
        let hub = BalanceHub::new(2).with_metrics(metrics.clone());
        let user = UserId::new();
        let mut sub = hub.register(user);

        for balance in 0..5 {
            hub.broadcast_balance(user, &update(balance));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.notifications_sent, 2);
        assert_eq!(snapshot.notifications_dropped, 3);

        // the oldest two updates survive
        let first: BalanceUpdate = serde_json::from_str(&sub.receiver.recv().await.unwrap()).unwrap();
        assert_eq!(first.balance, "0.00");
        let second: BalanceUpdate = serde_json::from_str(&sub.receiver.recv().await.unwrap()).unwrap();
        assert_eq!(second.balance, "0.01");
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_ignored() {
        let hub = BalanceHub::new(4);
        let user = UserId::new();
        let sub = hub.register(user);
        drop(sub);

        let delivery = hub.broadcast(user, &update(1));
        assert_eq!(delivery, Delivery::default());
    }
}
