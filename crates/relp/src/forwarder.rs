//! Acknowledgement forwarder
//!
//! Per-connection bookkeeping between the stages that complete transactions
//! (parsers, store, Kafka delivery) and the response cooker that answers the
//! client. Every live connection owns three structures:
//!
//! - a FIFO of transaction numbers that succeeded,
//! - a FIFO of transaction numbers that failed,
//! - the commit map of in-flight transaction numbers, whose smallest key is
//!   the only transaction the cooker may answer next.
//!
//! Connection ids are allocated here, monotonically, and never reused; on
//! disconnect the whole per-connection state is dropped as a unit, which
//! wakes any cooker still waiting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use skewer_model::{ConnId, TxNr};

struct ConnAcks {
    succ: SegQueue<TxNr>,
    fail: SegQueue<TxNr>,
    /// In-flight txnrs; the smallest key is next to commit
    comm: Mutex<BTreeMap<TxNr, ()>>,
    notify: Notify,
    closed: AtomicBool,
}

impl ConnAcks {
    fn new() -> Self {
        Self {
            succ: SegQueue::new(),
            fail: SegQueue::new(),
            comm: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }
}

/// Concurrent per-connection acknowledgement state
#[derive(Default)]
pub struct AckForwarder {
    conns: DashMap<ConnId, Arc<ConnAcks>>,
    next: AtomicU64,
}

impl AckForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next connection id and its empty state
    pub fn add_conn(&self) -> ConnId {
        let conn_id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.conns.insert(conn_id, Arc::new(ConnAcks::new()));
        conn_id
    }

    /// Drop all state of a connection; a pending `wait` returns `false`
    pub fn remove_conn(&self, conn_id: ConnId) {
        if let Some((_, acks)) = self.conns.remove(&conn_id) {
            acks.closed.store(true, Ordering::Release);
            acks.notify.notify_one();
        }
    }

    /// Dispose every connection (service stop)
    pub fn remove_all(&self) {
        let ids: Vec<ConnId> = self.conns.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove_conn(id);
        }
    }

    /// Mark `txnr` as in-flight, pending an outcome
    pub fn received(&self, conn_id: ConnId, txnr: TxNr) {
        if let Some(acks) = self.conns.get(&conn_id) {
            acks.comm.lock().insert(txnr, ());
        }
    }

    /// The outcome of `txnr` has been answered; forget it
    pub fn committed(&self, conn_id: ConnId, txnr: TxNr) {
        if let Some(acks) = self.conns.get(&conn_id) {
            acks.comm.lock().remove(&txnr);
        }
    }

    /// Smallest in-flight txnr, the only one allowed to be answered next
    pub fn next_to_commit(&self, conn_id: ConnId) -> Option<TxNr> {
        let acks = self.conns.get(&conn_id)?;
        let comm = acks.comm.lock();
        comm.first_key_value().map(|(txnr, _)| *txnr)
    }

    pub fn forward_succ(&self, conn_id: ConnId, txnr: TxNr) {
        if let Some(acks) = self.conns.get(&conn_id) {
            acks.succ.push(txnr);
            acks.notify.notify_one();
        }
    }

    pub fn forward_fail(&self, conn_id: ConnId, txnr: TxNr) {
        if let Some(acks) = self.conns.get(&conn_id) {
            acks.fail.push(txnr);
            acks.notify.notify_one();
        }
    }

    /// Non-blocking dequeue of a succeeded txnr
    pub fn get_succ(&self, conn_id: ConnId) -> Option<TxNr> {
        self.conns.get(&conn_id)?.succ.pop()
    }

    /// Non-blocking dequeue of a failed txnr
    pub fn get_fail(&self, conn_id: ConnId) -> Option<TxNr> {
        self.conns.get(&conn_id)?.fail.pop()
    }

    /// Wait until either queue holds something, or the connection is
    /// disposed (`false`)
    pub async fn wait(&self, conn_id: ConnId) -> bool {
        let acks = match self.conns.get(&conn_id) {
            Some(entry) => Arc::clone(&entry),
            None => return false,
        };
        loop {
            if !acks.succ.is_empty() || !acks.fail.is_empty() {
                return true;
            }
            if acks.closed.load(Ordering::Acquire) {
                return false;
            }
            // a single waiter per connection: notify_one stores the permit
            // even when we are not parked yet, so nothing is lost between
            // the checks above and this await
            acks.notify.notified().await;
        }
    }

    /// Number of live connections, for tests and metrics
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn conn_ids_are_monotonic_and_unique() {
        let fwd = AckForwarder::new();
        let a = fwd.add_conn();
        let b = fwd.add_conn();
        assert!(b > a);
        fwd.remove_conn(a);
        let c = fwd.add_conn();
        assert!(c > b, "ids are never reused");
    }

    #[test]
    fn next_to_commit_is_the_minimum_in_flight() {
        let fwd = AckForwarder::new();
        let id = fwd.add_conn();

        assert_eq!(fwd.next_to_commit(id), None);
        fwd.received(id, 7);
        fwd.received(id, 3);
        fwd.received(id, 5);
        assert_eq!(fwd.next_to_commit(id), Some(3));

        fwd.committed(id, 3);
        assert_eq!(fwd.next_to_commit(id), Some(5));
        fwd.committed(id, 5);
        fwd.committed(id, 7);
        assert_eq!(fwd.next_to_commit(id), None);
    }

    #[test]
    fn queues_are_fifo_and_non_blocking() {
        let fwd = AckForwarder::new();
        let id = fwd.add_conn();

        assert_eq!(fwd.get_succ(id), None);
        fwd.forward_succ(id, 1);
        fwd.forward_succ(id, 2);
        fwd.forward_fail(id, 3);

        assert_eq!(fwd.get_succ(id), Some(1));
        assert_eq!(fwd.get_succ(id), Some(2));
        assert_eq!(fwd.get_succ(id), None);
        assert_eq!(fwd.get_fail(id), Some(3));
    }

    #[test]
    fn operations_on_unknown_conns_are_noops() {
        let fwd = AckForwarder::new();
        fwd.received(99, 1);
        fwd.forward_succ(99, 1);
        assert_eq!(fwd.get_succ(99), None);
        assert_eq!(fwd.next_to_commit(99), None);
        fwd.remove_conn(99);
    }

    #[tokio::test]
    async fn wait_wakes_on_forward() {
        let fwd = Arc::new(AckForwarder::new());
        let id = fwd.add_conn();

        let waiter = {
            let fwd = Arc::clone(&fwd);
            tokio::spawn(async move { fwd.wait(id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        fwd.forward_succ(id, 1);

        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(woke);
    }

    #[tokio::test]
    async fn wait_returns_false_on_disposal() {
        let fwd = Arc::new(AckForwarder::new());
        let id = fwd.add_conn();

        let waiter = {
            let fwd = Arc::clone(&fwd);
            tokio::spawn(async move { fwd.wait(id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        fwd.remove_conn(id);

        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!woke);
        assert!(!fwd.wait(id).await, "disposed conn stays disposed");
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_queues_hold_items() {
        let fwd = AckForwarder::new();
        let id = fwd.add_conn();
        fwd.forward_fail(id, 9);
        assert!(fwd.wait(id).await);
    }

    #[test]
    fn remove_all_disposes_everything() {
        let fwd = AckForwarder::new();
        let a = fwd.add_conn();
        let b = fwd.add_conn();
        fwd.received(a, 1);
        fwd.received(b, 1);
        fwd.remove_all();
        assert!(fwd.is_empty());
        assert_eq!(fwd.next_to_commit(a), None);
    }
}
