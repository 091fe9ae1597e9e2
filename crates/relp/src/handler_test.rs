//! Tests for the response cooker
//!
//! The cooker is the single ordering authority for RELP responses: whatever
//! order completions arrive in, the client sees strictly increasing txnrs.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};

use skewer_streaming::{BufferPool, ServiceMetrics};

use crate::forwarder::AckForwarder;
use crate::handler::response_cooker;
use crate::service::{RelpMetrics, RelpShared};

fn shared() -> Arc<RelpShared> {
    Arc::new(RelpShared {
        forwarder: AckForwarder::new(),
        pool: Arc::new(BufferPool::new(4, 1024)),
        metrics: Arc::new(ServiceMetrics::new()),
        relp_metrics: Arc::new(RelpMetrics::default()),
        raw_tx: parking_lot::Mutex::new(None),
        max_message_size: 1024,
    })
}

async fn read_line(reader: &mut tokio::io::DuplexStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = timeout(Duration::from_secs(2), reader.read(&mut byte))
            .await
            .expect("response expected within deadline")
            .unwrap();
        assert_ne!(n, 0, "peer closed before a full line");
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return String::from_utf8(line).unwrap();
        }
    }
}

#[tokio::test]
async fn out_of_order_completions_are_answered_in_txnr_order() {
    let shared = shared();
    let conn_id = shared.forwarder.add_conn();

    let (writer_side, mut reader) = tokio::io::duplex(4096);
    let cooker = tokio::spawn(response_cooker(
        Arc::clone(&shared),
        Arc::new(Mutex::new(writer_side)),
        conn_id,
        "test".into(),
    ));

    shared.forwarder.received(conn_id, 2);
    shared.forwarder.received(conn_id, 3);

    // the broker acks 3 first, then 2
    shared.forwarder.forward_succ(conn_id, 3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    shared.forwarder.forward_succ(conn_id, 2);

    assert_eq!(read_line(&mut reader).await, "2 rsp 6 200 OK\n");
    assert_eq!(read_line(&mut reader).await, "3 rsp 6 200 OK\n");

    shared.forwarder.remove_conn(conn_id);
    cooker.await.unwrap();
}

#[tokio::test]
async fn failures_are_cooked_in_order_too() {
    let shared = shared();
    let conn_id = shared.forwarder.add_conn();

    let (writer_side, mut reader) = tokio::io::duplex(4096);
    let cooker = tokio::spawn(response_cooker(
        Arc::clone(&shared),
        Arc::new(Mutex::new(writer_side)),
        conn_id,
        "test".into(),
    ));

    for txnr in [5, 6, 7] {
        shared.forwarder.received(conn_id, txnr);
    }
    shared.forwarder.forward_fail(conn_id, 6);
    shared.forwarder.forward_succ(conn_id, 7);
    shared.forwarder.forward_succ(conn_id, 5);

    assert_eq!(read_line(&mut reader).await, "5 rsp 6 200 OK\n");
    assert_eq!(read_line(&mut reader).await, "6 rsp 6 500 KO\n");
    assert_eq!(read_line(&mut reader).await, "7 rsp 6 200 OK\n");

    shared.forwarder.remove_conn(conn_id);
    cooker.await.unwrap();
}

#[tokio::test]
async fn first_outcome_wins_when_both_arrive() {
    let shared = shared();
    let conn_id = shared.forwarder.add_conn();

    let (writer_side, mut reader) = tokio::io::duplex(4096);
    let cooker = tokio::spawn(response_cooker(
        Arc::clone(&shared),
        Arc::new(Mutex::new(writer_side)),
        conn_id,
        "test".into(),
    ));

    shared.forwarder.received(conn_id, 2);
    shared.forwarder.forward_succ(conn_id, 2);
    shared.forwarder.forward_fail(conn_id, 2);

    assert_eq!(read_line(&mut reader).await, "2 rsp 6 200 OK\n");

    // a later transaction proves no duplicate answer for 2 was emitted
    shared.forwarder.received(conn_id, 3);
    shared.forwarder.forward_succ(conn_id, 3);
    assert_eq!(read_line(&mut reader).await, "3 rsp 6 200 OK\n");

    shared.forwarder.remove_conn(conn_id);
    cooker.await.unwrap();
}

#[tokio::test]
async fn cooker_exits_when_connection_is_disposed() {
    let shared = shared();
    let conn_id = shared.forwarder.add_conn();

    let (writer_side, _reader) = tokio::io::duplex(4096);
    let cooker = tokio::spawn(response_cooker(
        Arc::clone(&shared),
        Arc::new(Mutex::new(writer_side)),
        conn_id,
        "test".into(),
    ));

    shared.forwarder.remove_conn(conn_id);
    timeout(Duration::from_secs(1), cooker)
        .await
        .expect("cooker should exit on disposal")
        .unwrap();
}
