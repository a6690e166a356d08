//! Subscriber fan-out with explicit subscribe/unsubscribe.
//!
//! Each subscriber owns an unbounded receiver. Closed receivers are pruned on
//! the next notification; [`Observers::clear`] drops every sender so all
//! receivers observe end-of-stream deterministically.

use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Handle returned by [`Observers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

pub struct Observers<E> {
    next_id: u64,
    subscribers: BTreeMap<SubscriptionId, mpsc::UnboundedSender<E>>,
}

impl<E: Clone> Observers<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            subscribers: BTreeMap::new(),
        }
    }

    pub fn subscribe(&mut self) -> (SubscriptionId, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    /// Returns `false` if the id was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Deliver `event` to every live subscriber in subscription order.
    pub fn notify(&mut self, event: &E) {
        self.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Drop all subscribers.
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}

impl<E: Clone> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}
