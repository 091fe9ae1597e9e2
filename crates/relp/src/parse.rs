//! Parser pool
//!
//! N workers (one per hardware thread) drain the raw-frame ring, decode and
//! parse each frame, and hand the result to the configured sink: the parsed
//! queue on the direct-to-Kafka path, or the store on the indirect path.
//! Buffers go back to the pool whatever the outcome.

use std::sync::Arc;

use crossfire::MAsyncRx;
use tokio::sync::mpsc;
use ulid::Ulid;

use skewer_model::{ParsedMessage, ParsersEnv, RawTcpMessage, Stasher, TcpUdpParsedMessage};

use crate::service::{RelpShared, ServiceEvent};

/// Where parsed messages go
pub(crate) enum ParsedSink {
    /// Direct mode: enqueue for the Kafka fan-out
    Direct(crossfire::MAsyncTx<TcpUdpParsedMessage>),
    /// Store mode: stash synchronously, acks follow the stash outcome
    Store(Arc<dyn Stasher>),
}

pub(crate) async fn parse_loop(
    shared: Arc<RelpShared>,
    raw_rx: MAsyncRx<RawTcpMessage>,
    sink: ParsedSink,
    events: mpsc::UnboundedSender<ServiceEvent>,
) {
    let env = ParsersEnv::new();

    while let Ok(raw) = raw_rx.recv().await {
        let RawTcpMessage {
            message,
            client,
            local_port,
            unix_socket_path,
            format,
            encoding,
            dont_parse_sd,
            conf_id,
            conn_id,
            txnr,
        } = raw;

        let result = env.parse(format, &message, encoding, dont_parse_sd);
        shared.pool.give_back(message);

        let fields = match result {
            Err(e) => {
                shared.metrics.parsing_error();
                tracing::warn!(
                    client = %client,
                    format = %format,
                    error = %e,
                    "parsing error"
                );
                continue;
            }
            Ok(fields) if fields.is_empty() => continue,
            Ok(fields) => fields,
        };

        let mut parsed = TcpUdpParsedMessage {
            parsed: ParsedMessage {
                fields,
                client,
                local_port,
                unix_socket_path,
            },
            txnr,
            conf_id,
            conn_id,
            uid: None,
        };

        match &sink {
            ParsedSink::Direct(parsed_tx) => {
                if parsed_tx.send(parsed).await.is_err() {
                    // queue disposed: the service is stopping
                    break;
                }
            }
            ParsedSink::Store(stasher) => {
                parsed.uid = Some(Ulid::new());
                match stasher.stash(parsed) {
                    Ok(()) => shared.forwarder.forward_succ(conn_id, txnr),
                    Err(e) if e.is_fatal() => {
                        shared.forwarder.forward_fail(conn_id, txnr);
                        tracing::error!(error = %e, "fatal error pushing RELP message to the store");
                        let _ = events.send(ServiceEvent::Fatal(e.to_string()));
                        return;
                    }
                    Err(e) => {
                        shared.forwarder.forward_fail(conn_id, txnr);
                        tracing::warn!(error = %e, "non-fatal error pushing RELP message to the store");
                    }
                }
            }
        }
    }
}
