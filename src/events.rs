//! Typed event channels.
//!
//! Each component owns one `EventBus` over its own event enum. Subscribers
//! get an unbounded receiver; publishing never blocks and silently prunes
//! receivers that were dropped.

use tokio::sync::mpsc;

pub struct EventBus<E> {
    subscribers: Vec<mpsc::UnboundedSender<E>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self { subscribers: Vec::new() }
    }
}

impl<E: Clone> EventBus<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, event: E) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Take everything currently queued on a receiver without waiting.
pub fn drain<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> Vec<E> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
