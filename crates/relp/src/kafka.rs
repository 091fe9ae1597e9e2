//! Destination fan-out and Kafka delivery correlation
//!
//! One fan-out worker evaluates the per-config routing hooks and hands
//! serialized messages to the producer, tagged with `{txnr, conn_id}`. A
//! delivery worker consumes the producer's completion events and forwards
//! each outcome to the ack forwarder, so responses find their way back to
//! the right RELP connection. A fatal broker error stops the whole service
//! into the waiting state.
//!
//! In test mode messages are echoed to stderr and acked immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossfire::MAsyncRx;
use rdkafka::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use tokio::sync::mpsc;

use skewer_model::{ConfId, ConnId, FilterEnv, FilterResult, KafkaDestConfig, SyslogConfig,
    TcpUdpParsedMessage, TxNr};

use crate::service::{RelpShared, ServiceEvent};

/// Opaque metadata round-tripped through the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMeta {
    pub txnr: TxNr,
    pub conn_id: ConnId,
}

/// Producer completion, success or failure, with its metadata back
#[derive(Debug)]
pub enum DeliveryEvent {
    Ack {
        meta: AckMeta,
        topic: String,
    },
    Nack {
        meta: AckMeta,
        topic: String,
        error: KafkaError,
    },
}

/// Broker errors that poison the producer for good
pub fn is_fatal_kafka_error(error: &KafkaError) -> bool {
    matches!(
        error,
        KafkaError::MessageProduction(
            RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed
                | RDKafkaErrorCode::UnsupportedSASLMechanism
                | RDKafkaErrorCode::InvalidRequiredAcks
        )
    )
}

/// Async Kafka producer whose deliveries come back on one event channel
pub struct RelpProducer {
    producer: FutureProducer,
    delivery_timeout: Duration,
    events_tx: mpsc::UnboundedSender<DeliveryEvent>,
}

impl RelpProducer {
    pub fn new(
        config: &KafkaDestConfig,
    ) -> Result<(RelpProducer, mpsc::UnboundedReceiver<DeliveryEvent>), KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", &config.client_id)
            .set("compression.codec", &config.compression)
            .set(
                "message.timeout.ms",
                config.delivery_timeout.as_millis().to_string(),
            )
            .create()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok((
            RelpProducer {
                producer,
                delivery_timeout: config.delivery_timeout,
                events_tx,
            },
            events_rx,
        ))
    }

    /// Hand one record to the broker; the outcome arrives on the event
    /// channel with `meta` attached
    pub fn send(
        &self,
        topic: String,
        key: String,
        partition: Option<i32>,
        payload: Vec<u8>,
        timestamp_ms: i64,
        meta: AckMeta,
    ) {
        let producer = self.producer.clone();
        let events_tx = self.events_tx.clone();
        let timeout = self.delivery_timeout;
        tokio::spawn(async move {
            let mut record = FutureRecord::to(&topic)
                .key(&key)
                .payload(&payload)
                .timestamp(timestamp_ms);
            if let Some(partition) = partition {
                record = record.partition(partition);
            }
            let event = match producer.send(record, Timeout::After(timeout)).await {
                Ok(_) => DeliveryEvent::Ack { meta, topic },
                Err((error, _)) => DeliveryEvent::Nack { meta, topic, error },
            };
            let _ = events_tx.send(event);
        });
    }

    /// Flush outstanding deliveries before dropping the producer
    pub async fn close(self) {
        let producer = self.producer;
        let _ = tokio::task::spawn_blocking(move || {
            let _ = producer.flush(Timeout::After(Duration::from_secs(5)));
        })
        .await;
    }
}

/// Fan-out worker: routing hooks, serialisation, producer hand-off
pub(crate) async fn fanout_loop(
    shared: Arc<RelpShared>,
    parsed_rx: MAsyncRx<TcpUdpParsedMessage>,
    configs: Arc<HashMap<ConfId, Arc<SyslogConfig>>>,
    producer: Option<RelpProducer>,
    test: bool,
) {
    let mut envs: HashMap<ConfId, FilterEnv> = HashMap::new();

    while let Ok(message) = parsed_rx.recv().await {
        let conn_id = message.conn_id;
        let txnr = message.txnr;
        let client = message.parsed.client.clone();

        if !envs.contains_key(&message.conf_id) {
            match configs.get(&message.conf_id) {
                Some(config) => {
                    envs.insert(message.conf_id, FilterEnv::new(config));
                }
                None => {
                    tracing::warn!(
                        conf_id = %message.conf_id,
                        txnr,
                        "could not find the configuration for a message"
                    );
                    continue;
                }
            }
        }
        let Some(env) = envs.get(&message.conf_id) else {
            continue;
        };

        let fields = &message.parsed.fields;
        let topic = env.topic(fields);
        if topic.is_empty() {
            tracing::warn!(client = %client, txnr, "topic could not be calculated");
            shared.forwarder.forward_fail(conn_id, txnr);
            continue;
        }
        let partition_key = env.partition_key(fields);
        let partition_number = env.partition_number(fields);

        match env.filter(fields) {
            FilterResult::Pass => shared.relp_metrics.filter_passing(),
            FilterResult::Dropped => {
                shared.forwarder.forward_fail(conn_id, txnr);
                shared.relp_metrics.filter_dropped();
                continue;
            }
            FilterResult::Rejected => {
                shared.forwarder.forward_fail(conn_id, txnr);
                shared.relp_metrics.filter_rejected();
                continue;
            }
        }

        let timestamp_ms = fields.effective_time().timestamp_millis();
        let serialized = match serde_json::to_vec(&message.parsed) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(client = %client, txnr, error = %e, "error serialising message");
                shared.forwarder.forward_fail(conn_id, txnr);
                continue;
            }
        };

        if test {
            // fake sends: echo to stderr, ack immediately
            eprintln!("pkey: '{partition_key}' topic:'{topic}' txnr:'{txnr}'");
            eprintln!("{}", String::from_utf8_lossy(&serialized));
            eprintln!();
            shared.forwarder.forward_succ(conn_id, txnr);
        } else if let Some(producer) = &producer {
            producer.send(
                topic,
                partition_key,
                partition_number,
                serialized,
                timestamp_ms,
                AckMeta { txnr, conn_id },
            );
        } else {
            shared.forwarder.forward_fail(conn_id, txnr);
        }
    }

    if let Some(producer) = producer {
        producer.close().await;
    }
}

/// Delivery worker: producer completions back to the ack forwarder
pub(crate) async fn delivery_loop(
    shared: Arc<RelpShared>,
    mut events_rx: mpsc::UnboundedReceiver<DeliveryEvent>,
    service_events: mpsc::UnboundedSender<ServiceEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            DeliveryEvent::Ack { meta, .. } => {
                shared.relp_metrics.kafka_ack();
                shared.forwarder.forward_succ(meta.conn_id, meta.txnr);
            }
            DeliveryEvent::Nack { meta, topic, error } => {
                shared.relp_metrics.kafka_nack();
                shared.forwarder.forward_fail(meta.conn_id, meta.txnr);
                tracing::info!(
                    error = %error,
                    txnr = meta.txnr,
                    topic = %topic,
                    "NACK from Kafka"
                );
                if is_fatal_kafka_error(&error) {
                    let _ = service_events.send(ServiceEvent::Fatal(error.to_string()));
                    return;
                }
            }
        }
    }
}
