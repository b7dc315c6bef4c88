use tokio::sync::mpsc::{self, error::TrySendError};

/// Outcome of a non-blocking hand-off to a bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Sent,
    /// Queue full; the item was discarded and the queue left untouched.
    Dropped,
    /// Receiver gone.
    Closed,
}

/// Drop-newest hand-off: never waits for room.
pub fn offer<T>(tx: &mpsc::Sender<T>, item: T) -> Offer {
    match tx.try_send(item) {
        Ok(()) => Offer::Sent,
        Err(TrySendError::Full(_)) => Offer::Dropped,
        Err(TrySendError::Closed(_)) => Offer::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_drops_newest_without_blocking() {
        let (tx, mut rx) = mpsc::channel(2);
        assert_eq!(offer(&tx, 1), Offer::Sent);
        assert_eq!(offer(&tx, 2), Offer::Sent);
        assert_eq!(offer(&tx, 3), Offer::Dropped);
        assert_eq!(tx.capacity(), 0);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert!(rx.try_recv().is_err());

        // Room again after draining.
        assert_eq!(offer(&tx, 4), Offer::Sent);
        assert_eq!(rx.recv().await, Some(4));
    }

    #[test]
    fn closed_receiver_is_reported() {
        let (tx, rx) = mpsc::channel::<u8>(1);
        drop(rx);
        assert_eq!(offer(&tx, 1), Offer::Closed);
    }
}
