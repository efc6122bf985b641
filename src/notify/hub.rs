//! Notification hub for broadcasting mutations.

use crate::tracked::Mutation;
use crate::types::ObjectKey;
use crossbeam_channel::{bounded, unbounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{
    DropReason, Notification, SubscriptionConfig, Subscription, SubscriptionId,
};

/// Internal subscriber state.
struct Subscriber {
    config: SubscriptionConfig,
    sender: Sender<Notification>,
}

impl Subscriber {
    /// Try to send. Returns false if the buffer is full or the handle is gone.
    fn try_send(&self, notification: Notification) -> bool {
        match self.sender.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn wants(&self, notification: &Notification) -> bool {
        match notification {
            Notification::Changing { key, .. } => {
                self.config.filter.include_changing && self.config.filter.matches(key)
            }
            Notification::Changed(mutation) => self.config.filter.matches(&mutation.key),
            Notification::Dropped { .. } => false,
        }
    }
}

/// Fans mutation notifications out to subscribers.
pub struct NotificationHub {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber. Only notifications broadcast after this call
    /// are delivered.
    pub fn subscribe(&self, config: SubscriptionConfig) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = match config.buffer_size {
            Some(size) => bounded(size),
            None => unbounded(),
        };

        self.subscribers
            .write()
            .insert(id, Subscriber { config, sender });

        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(subscriber) = self.subscribers.write().remove(&id) {
            let _ = subscriber.sender.try_send(Notification::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Announce that `key.property` is about to change.
    pub fn changing(&self, key: ObjectKey, property: &'static str) {
        self.broadcast(Notification::Changing { key, property });
    }

    /// Announce a completed mutation.
    pub fn changed(&self, mutation: Mutation) {
        tracing::trace!(key = %mutation.key, property = mutation.property, "mutation");
        self.broadcast(Notification::Changed(mutation));
    }

    /// Drops subscribers that fail to receive.
    fn broadcast(&self, notification: Notification) {
        let mut to_remove = Vec::new();

        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if subscriber.wants(&notification) && !subscriber.try_send(notification.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in to_remove {
                if let Some(subscriber) = subscribers.remove(&id) {
                    tracing::warn!(subscription = id.0, "dropping slow subscriber");
                    let _ = subscriber.sender.try_send(Notification::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationFilter;
    use crate::tracked::MutationKind;
    use crate::types::{ObjectId, PropertyValue, TypeTag, Value};
    use std::time::Duration;

    fn make_mutation(tag: i32) -> Mutation {
        Mutation {
            key: ObjectKey::new(TypeTag(tag), ObjectId::new()),
            property: "name",
            kind: MutationKind::Set {
                old: PropertyValue::Plain(Value::Int(1)),
                new: PropertyValue::Plain(Value::Int(2)),
            },
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let hub = NotificationHub::new();

        let subscription = hub.subscribe(SubscriptionConfig::default());
        assert_eq!(hub.subscription_count(), 1);

        hub.unsubscribe(subscription.id);
        assert_eq!(hub.subscription_count(), 0);
        assert!(matches!(
            subscription.try_recv(),
            Some(Notification::Dropped {
                reason: DropReason::Unsubscribed
            })
        ));
    }

    #[test]
    fn test_changing_only_when_requested() {
        let hub = NotificationHub::new();
        let quiet = hub.subscribe(SubscriptionConfig::default());
        let loud = hub.subscribe(SubscriptionConfig {
            filter: NotificationFilter::all(),
            ..Default::default()
        });

        let mutation = make_mutation(1);
        hub.changing(mutation.key, mutation.property);
        hub.changed(mutation.clone());

        assert_eq!(quiet.drain(), vec![Notification::Changed(mutation.clone())]);

        let received = loud.drain();
        assert_eq!(received.len(), 2);
        assert!(matches!(received[0], Notification::Changing { property: "name", .. }));
        assert_eq!(received[1], Notification::Changed(mutation));
    }

    #[test]
    fn test_type_filter() {
        let hub = NotificationHub::new();
        let subscription = hub.subscribe(SubscriptionConfig {
            filter: NotificationFilter::types(vec![TypeTag(2)]),
            ..Default::default()
        });

        hub.changed(make_mutation(1));
        assert!(subscription.recv_timeout(Duration::from_millis(20)).is_none());

        hub.changed(make_mutation(2));
        assert!(subscription.try_recv().is_some());
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let hub = NotificationHub::new();
        let _subscription = hub.subscribe(SubscriptionConfig {
            buffer_size: Some(2),
            ..Default::default()
        });

        for _ in 0..10 {
            hub.changed(make_mutation(1));
        }

        assert_eq!(hub.subscription_count(), 0);
    }

    #[test]
    fn test_unbounded_never_dropped() {
        let hub = NotificationHub::new();
        let subscription = hub.subscribe(SubscriptionConfig::unbounded());

        for _ in 0..5000 {
            hub.changed(make_mutation(1));
        }

        assert_eq!(hub.subscription_count(), 1);
        assert_eq!(subscription.drain().len(), 5000);
    }
}
