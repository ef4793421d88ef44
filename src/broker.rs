//! In-process publish/subscribe hub.
//!
//! Every device session owns one broker and fans device data out through it.
//! Publishing never blocks: a subscriber whose queue is full simply misses
//! that message. The framing layer resynchronizes, so per-subscriber gaps are
//! acceptable where per-publisher stalls are not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Queue capacity of each subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 32;

/// A cloneable handle to a topic hub.
///
/// Dropping all handles does not shut the broker down; the owning session
/// calls [`Broker::shutdown`] when its scope ends.
#[derive(Debug)]
pub struct Broker<T> {
    inner: Arc<Mutex<Registry<T>>>,
    capacity: usize,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            capacity: self.capacity,
        }
    }
}

#[derive(Debug)]
struct Registry<T> {
    next_id: u64,
    subscribers: HashMap<&'static str, Vec<(u64, mpsc::Sender<T>)>>,
    shut_down: bool,
}

/// A subscription to a single topic.
///
/// Receives messages published after the subscription was created.
/// Closed by [`Broker::unsubscribe`] or broker shutdown.
#[derive(Debug)]
pub struct Subscription<T> {
    id: u64,
    topic: &'static str,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    /// Receive the next message, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<T, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

impl<T: Clone> Broker<T> {
    /// A broker whose subscribers each get a bounded queue of `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                subscribers: HashMap::new(),
                shut_down: false,
            })),
            capacity,
        }
    }

    /// Subscribe to `topic` with a fresh, independent queue.
    pub fn subscribe(&self, topic: &'static str) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut registry = self.inner.lock().expect("Broker lock poisoned");
        let id = registry.next_id;
        registry.next_id += 1;

        if registry.shut_down {
            // The sender is dropped right away, so the subscription
            // reads as closed.
            debug!(topic, "Subscribe after shutdown");
        } else {
            registry.subscribers.entry(topic).or_default().push((id, tx));
        }

        Subscription { id, topic, rx }
    }

    /// Deliver `message` to every current subscriber of `topic` without
    /// blocking. Subscribers with a full queue miss this message.
    pub fn try_publish(&self, topic: &'static str, message: T) {
        let mut registry = self.inner.lock().expect("Broker lock poisoned");

        if registry.shut_down {
            debug!(topic, "Dropping publish after shutdown");
            return;
        }

        let Some(subscribers) = registry.subscribers.get_mut(topic) else {
            return;
        };

        // Senders whose receiver is gone are pruned as we go.
        subscribers.retain(|(id, tx)| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(topic, subscriber = id, "Subscriber queue full, dropping message");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Remove the subscriber and close its channel.
    pub fn unsubscribe(&self, subscription: &Subscription<T>) {
        let mut registry = self.inner.lock().expect("Broker lock poisoned");

        if let Some(subscribers) = registry.subscribers.get_mut(subscription.topic) {
            subscribers.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Close every subscriber channel and reject subsequent publishes.
    pub fn shutdown(&self) {
        let mut registry = self.inner.lock().expect("Broker lock poisoned");
        registry.shut_down = true;
        registry.subscribers.clear();
    }
}
