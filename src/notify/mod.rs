//! Mutation notifications.
//!
//! Every tracked mutation applied through the store is announced twice: a
//! [`Notification::Changing`] before the value is written and a
//! [`Notification::Changed`] carrying the full [`Mutation`](crate::Mutation)
//! after. Tracking sessions consume these through an unbounded
//! subscription; external listeners may subscribe with a bounded buffer and a
//! type filter.
//!
//! # Example
//!
//! ```ignore
//! let subscription = store.subscribe(SubscriptionConfig {
//!     filter: NotificationFilter::all(),
//!     ..Default::default()
//! });
//!
//! store.set(id, "name", Value::from("Oslo").into())?;
//!
//! for notification in subscription.drain() {
//!     println!("{notification:?}");
//! }
//! ```

mod hub;
mod types;

pub use hub::NotificationHub;
pub use types::{
    DropReason, Notification, NotificationFilter, Subscription, SubscriptionConfig,
    SubscriptionId,
};
