//! Notification types.

use crate::tracked::Mutation;
use crate::types::{ObjectKey, TypeTag};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Unique subscription identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered notifications before the subscriber is dropped.
    /// `None` means unbounded; tracking sessions always subscribe this way.
    pub buffer_size: Option<usize>,

    /// Filter criteria.
    pub filter: NotificationFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: Some(1000),
            filter: NotificationFilter::default(),
        }
    }
}

impl SubscriptionConfig {
    /// Unbounded subscription to every completed mutation.
    pub fn unbounded() -> Self {
        Self {
            buffer_size: None,
            filter: NotificationFilter::default(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct NotificationFilter {
    /// Only instances of these types (None = all types).
    pub types: Option<Vec<TypeTag>>,

    /// Also deliver [`Notification::Changing`].
    pub include_changing: bool,
}

impl NotificationFilter {
    /// Only instances of the given types.
    pub fn types(types: Vec<TypeTag>) -> Self {
        Self {
            types: Some(types),
            ..Default::default()
        }
    }

    /// Before and after notifications for every type.
    pub fn all() -> Self {
        Self {
            types: None,
            include_changing: true,
        }
    }

    pub(crate) fn matches(&self, key: &ObjectKey) -> bool {
        match &self.types {
            Some(types) => types.contains(&key.tag),
            None => true,
        }
    }
}

/// Delivered to subscribers around every tracked mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// A property is about to change.
    Changing {
        key: ObjectKey,
        property: &'static str,
    },

    /// A property has changed.
    Changed(Mutation),

    /// The subscription was dropped.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Handle for receiving notifications.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub(crate) receiver: Receiver<Notification>,
}

impl Subscription {
    /// Block until the next notification.
    pub fn recv(&self) -> Option<Notification> {
        self.receiver.recv().ok()
    }

    /// Next notification if one is buffered.
    pub fn try_recv(&self) -> Option<Notification> {
        match self.receiver.try_recv() {
            Ok(notification) => Some(notification),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        match self.receiver.recv_timeout(timeout) {
            Ok(notification) => Some(notification),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything buffered so far, without blocking.
    pub fn drain(&self) -> Vec<Notification> {
        self.receiver.try_iter().collect()
    }
}
