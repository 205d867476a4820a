//! Attached subscribers and fan-out.
//!
//! Each subscriber is a bounded queue drained by its connection's writer
//! task. Enqueueing never waits: a subscriber whose queue is closed or full
//! is removed from the set. Removing a full one also aborts its writer,
//! which closes the queue and ends the connection.

use axum::extract::ws::Utf8Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::debug;

/// Work item for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Utf8Bytes),
    Ping,
    /// Send a close frame and stop writing
    Close,
}

/// One attached subscriber
#[derive(Debug)]
pub struct Subscriber {
    pub addr: SocketAddr,
    pub tx: mpsc::Sender<Outbound>,
    pub writer: Option<JoinHandle<()>>,
}

/// Result of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

/// Set of attached subscribers keyed by connection id
#[derive(Debug, Default)]
pub struct SubscriberSet {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a subscriber and return its id
    pub fn register(&self, addr: SocketAddr, tx: mpsc::Sender<Outbound>, writer: Option<JoinHandle<()>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, Subscriber { addr, tx, writer });
        id
    }

    /// Detach a subscriber; `false` if it was already gone
    pub fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queue the same frame for every subscriber, dropping those that fail
    pub fn broadcast(&self, frame: Utf8Bytes) -> FanOut {
        let mut subscribers = self.lock();
        let mut report = FanOut::default();

        subscribers.retain(|id, subscriber| match subscriber.tx.try_send(Outbound::Text(frame.clone())) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!(id, addr = %subscriber.addr, "Subscriber queue full, dropping subscriber");
                if let Some(writer) = &subscriber.writer {
                    writer.abort();
                }
                report.dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(id, addr = %subscriber.addr, "Subscriber gone, dropping subscriber");
                report.dropped += 1;
                false
            }
        });
        report
    }

    /// Detach and return every subscriber
    pub fn drain(&self) -> Vec<Subscriber> {
        self.lock().drain().map(|(_, subscriber)| subscriber).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_remove() {
        let set = SubscriberSet::new();
        let (tx, _rx) = mpsc::channel(1);
        let first = set.register(addr(1), tx.clone(), None);
        let second = set.register(addr(2), tx, None);

        assert_ne!(first, second);
        assert_eq!(set.len(), 2);
        assert!(set.remove(first));
        assert!(!set.remove(first));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_broadcast_delivers_same_frame() {
        let set = SubscriberSet::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        set.register(addr(1), tx_a, None);
        set.register(addr(2), tx_b, None);

        let report = set.broadcast(Utf8Bytes::from("frame"));
        assert_eq!(report, FanOut { delivered: 2, dropped: 0 });
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Text(Utf8Bytes::from("frame")));
        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Text(Utf8Bytes::from("frame")));
    }

    #[test]
    fn test_broadcast_prunes_closed_and_full() {
        let set = SubscriberSet::new();
        let (tx_live, mut rx_live) = mpsc::channel(4);
        let (tx_closed, rx_closed) = mpsc::channel(4);
        let (tx_full, _rx_full) = mpsc::channel(1);
        set.register(addr(1), tx_live, None);
        set.register(addr(2), tx_closed, None);
        let full = set.register(addr(3), tx_full.clone(), None);
        drop(rx_closed);
        tx_full.try_send(Outbound::Ping).unwrap();

        let report = set.broadcast(Utf8Bytes::from("x"));
        assert_eq!(report, FanOut { delivered: 1, dropped: 2 });
        assert_eq!(set.len(), 1);
        assert!(!set.remove(full));
        assert!(rx_live.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_full_subscriber_is_disconnected() {
        let set = SubscriberSet::new();
        let (tx, rx) = mpsc::channel(1);
        let stalled = tokio::spawn(async move {
            let _rx = rx;
            std::future::pending::<()>().await
        });
        tx.try_send(Outbound::Ping).unwrap();
        set.register(addr(1), tx.clone(), Some(stalled));

        let report = set.broadcast(Utf8Bytes::from("x"));
        assert_eq!(report, FanOut { delivered: 0, dropped: 1 });
        assert!(set.is_empty());

        // The connection side observes its queue closing
        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .expect("writer should be aborted");
    }

    #[test]
    fn test_drain_empties_set() {
        let set = SubscriberSet::new();
        let (tx, _rx) = mpsc::channel(1);
        set.register(addr(1), tx.clone(), None);
        set.register(addr(2), tx, None);

        assert_eq!(set.drain().len(), 2);
        assert!(set.is_empty());
    }
}
