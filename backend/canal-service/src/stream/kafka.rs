use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as _;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{closed, pause, Message, MessageHandler, MessageId, Stream};
use crate::error::{CanalError, Result};
use crate::metrics::metrics;

/// A record fetched from a partition, detached from the client buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl FetchedRecord {
    fn into_message(self) -> Message {
        Message {
            id: MessageId::Offset {
                partition: self.partition,
                offset: self.offset,
            },
            stream: self.topic,
            key: self.key,
            value: self.value,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection reset, broker unreachable or end of partition.
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

/// The consumer-group client operations used by [`KafkaStream`].
#[async_trait]
pub trait PartitionLog: Send + Sync {
    /// Wait for the next record of any assigned partition.
    async fn fetch(&self) -> std::result::Result<FetchedRecord, FetchError>;

    /// Commit `next_offset` as the group position of `topic`/`partition`.
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// [`PartitionLog`] backed by an rdkafka `StreamConsumer` with manual commits.
pub struct RdKafkaLog {
    consumer: StreamConsumer,
}

impl RdKafkaLog {
    pub fn connect(brokers: &str, group_id: &str, topics: &[String]) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                CanalError::from(e)
            })?;

        consumer
            .subscribe(&topics.iter().map(|s| s.as_str()).collect::<Vec<_>>())
            .map_err(|e| {
                error!("Failed to subscribe to topics: {}", e);
                CanalError::from(e)
            })?;

        info!(group_id, brokers, "Kafka consumer subscribed to topics: {:?}", topics);
        Ok(Self { consumer })
    }
}

fn is_network_error(err: &KafkaError) -> bool {
    matches!(err, KafkaError::PartitionEOF(_))
        || matches!(
            err.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::BrokerTransportFailure
                    | RDKafkaErrorCode::AllBrokersDown
                    | RDKafkaErrorCode::NetworkException
                    | RDKafkaErrorCode::Resolve
            )
        )
}

#[async_trait]
impl PartitionLog for RdKafkaLog {
    async fn fetch(&self) -> std::result::Result<FetchedRecord, FetchError> {
        match self.consumer.recv().await {
            Ok(msg) => Ok(FetchedRecord {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(<[u8]>::to_vec).unwrap_or_default(),
                value: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            }),
            Err(err) if is_network_error(&err) => Err(FetchError::Network(err.to_string())),
            Err(err) => Err(FetchError::Other(err.to_string())),
        }
    }

    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

/// Partitioned-log transport.
///
/// Fetch errors never end the loop; they are logged and the fetch is retried
/// after `retry_interval`.
pub struct KafkaStream<L = RdKafkaLog> {
    log: L,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    retry_interval: Duration,
}

impl KafkaStream<RdKafkaLog> {
    pub fn connect(
        brokers: &str,
        group_id: &str,
        topics: &[String],
        retry_interval: Duration,
    ) -> Result<Self> {
        let log = RdKafkaLog::connect(brokers, group_id, topics)?;
        Ok(Self::new(log, retry_interval))
    }
}

impl<L: PartitionLog> KafkaStream<L> {
    pub fn new(log: L, retry_interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            log,
            closed: AtomicBool::new(false),
            shutdown,
            retry_interval,
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }
}

#[async_trait]
impl<L: PartitionLog> Stream for KafkaStream<L> {
    async fn read(&self, handler: &dyn MessageHandler) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let fetched = tokio::select! {
                _ = closed(&mut shutdown) => return Ok(()),
                fetched = self.log.fetch() => fetched,
            };

            let record = match fetched {
                Ok(record) => record,
                Err(err) => {
                    metrics().read_errors_total.inc();
                    match &err {
                        FetchError::Network(_) => error!(error = %err, "network error, retrying fetch"),
                        FetchError::Other(_) => error!(error = %err, "error fetching message"),
                    }
                    pause(&mut shutdown, self.retry_interval).await;
                    continue;
                }
            };

            let message = record.into_message();
            debug!(topic = %message.stream, id = %message.id, "new message");
            metrics()
                .messages_received_total
                .with_label_values(&[message.stream.as_str()])
                .inc();

            if let Err(err) = handler.on_message(&message).await {
                metrics().messages_failed_total.inc();
                error!(topic = %message.stream, id = %message.id, error = %err, "failed to handle message");
                if let Err(commit_err) = self.ack(&message).await {
                    warn!(id = %message.id, error = %commit_err, "failed to commit failed message");
                }
                return Err(err);
            }

            match self.ack(&message).await {
                Ok(()) => metrics()
                    .messages_acked_total
                    .with_label_values(&[message.stream.as_str()])
                    .inc(),
                Err(err) => warn!(id = %message.id, error = %err, "failed to commit Kafka offset"),
            }
        }
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        match &message.id {
            MessageId::Offset { partition, offset } => {
                self.log.commit(&message.stream, *partition, offset + 1)
            }
            MessageId::Entry(id) => Err(CanalError::Kafka(format!(
                "cannot commit stream entry {} on a partitioned log",
                id
            ))),
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        self.log.close()
    }
}
