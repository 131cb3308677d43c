//! Typed event channel helpers.
//!
//! Cross-layer notifications in waveline are typed enums on bounded
//! mpsc channels. Layers publish events; consumers pick them up
//! synchronously from their own task. No layer calls back into a
//! foreign thread.

use tokio::sync::mpsc;

/// Default depth for inter-layer event channels.
pub const EVENT_CHANNEL_DEPTH: usize = 128;

/// Sending half of a typed event channel.
pub type EventSender<E> = mpsc::Sender<E>;

/// Receiving half of a typed event channel.
pub type EventReceiver<E> = mpsc::Receiver<E>;

/// Create a bounded event channel with the stack-wide default depth.
pub fn event_channel<E>() -> (EventSender<E>, EventReceiver<E>) {
    mpsc::channel(EVENT_CHANNEL_DEPTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestEvent {
        Tick(u32),
    }

    #[tokio::test]
    async fn channel_round_trip() {
        let (tx, mut rx) = event_channel::<TestEvent>();
        tx.send(TestEvent::Tick(7)).await.unwrap();
        assert_eq!(rx.recv().await, Some(TestEvent::Tick(7)));
    }
}
