//! Fan-out of engine events to zero or more observers.
//!
//! Events are delivered on two paths: a `broadcast` channel for async
//! consumers, and synchronous callbacks registered with [`Observers::add_subscriber`].
//! Neither path can interrupt the publisher. Lagging receivers lose events,
//! and callback errors or panics are logged and skipped.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::warn;

/// Default buffer for broadcast receivers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Result returned by a synchronous subscriber.
pub type SubscriberResult = Result<(), String>;

/// A synchronous observer of events of type `T`.
pub trait Subscriber<T>: Send + Sync {
    /// Handle one event. Errors are logged by the publisher and otherwise ignored.
    fn notify(&self, event: &T) -> SubscriberResult;
}

impl<T, F> Subscriber<T> for F
where
    F: Fn(&T) -> SubscriberResult + Send + Sync,
{
    fn notify(&self, event: &T) -> SubscriberResult {
        self(event)
    }
}

/// Publisher side of an event stream.
pub struct Observers<T> {
    topic: &'static str,
    channel: broadcast::Sender<T>,
    callbacks: RwLock<Vec<Arc<dyn Subscriber<T>>>>,
}

impl<T> fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("topic", &self.topic)
            .field("receivers", &self.channel.receiver_count())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Observers<T> {
    /// Create a publisher for the named topic. The topic only appears in logs.
    pub fn new(topic: &'static str) -> Self {
        Self::with_capacity(topic, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(topic: &'static str, capacity: usize) -> Self {
        let (channel, _) = broadcast::channel(capacity.max(1));
        Self {
            topic,
            channel,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to the async stream. Only events published after this call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.channel.subscribe()
    }

    /// Register a synchronous callback.
    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber<T>>) {
        match self.callbacks.write() {
            Ok(mut callbacks) => callbacks.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
    }

    /// Number of registered callbacks plus live channel receivers.
    pub fn subscriber_count(&self) -> usize {
        let callbacks = match self.callbacks.read() {
            Ok(callbacks) => callbacks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        callbacks + self.channel.receiver_count()
    }

    /// Deliver an event to every observer.
    pub fn publish(&self, event: &T) {
        // No receivers is not an error.
        let _ = self.channel.send(event.clone());

        let callbacks = match self.callbacks.read() {
            Ok(callbacks) => callbacks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for callback in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback.notify(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(topic = self.topic, error = %err, "subscriber rejected event");
                }
                Err(_) => {
                    warn!(topic = self.topic, "subscriber panicked; continuing");
                }
            }
        }
    }
}
