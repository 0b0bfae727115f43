use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis_utils::{Consumer, ConsumerOptions, RedisBackend, StreamBackend, StreamError, StreamMessage};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::{closed, pause, Message, MessageHandler, MessageId, Stream};
use crate::error::{CanalError, Result};
use crate::metrics::metrics;

const KEY_FIELD: &str = "key";
const VALUE_FIELD: &str = "value";

/// Multi-stream consumer-group transport.
///
/// Read errors are logged and retried after `retry_interval`. Entries that do
/// not carry string `key` and `value` fields are acknowledged and skipped.
pub struct RedisStream<B = RedisBackend> {
    consumer: Consumer<B>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    retry_interval: Duration,
}

impl RedisStream<RedisBackend> {
    pub async fn connect(
        conn: ConnectionManager,
        options: ConsumerOptions,
        retry_interval: Duration,
    ) -> Result<Self> {
        Self::new(RedisBackend::new(conn), options, retry_interval).await
    }
}

impl<B: StreamBackend> RedisStream<B> {
    /// Build the transport, creating the consumer group on every stream
    /// that does not have it yet.
    pub async fn new(backend: B, options: ConsumerOptions, retry_interval: Duration) -> Result<Self> {
        let consumer = Consumer::new(backend, options);
        consumer.ensure_groups().await?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            consumer,
            closed: AtomicBool::new(false),
            shutdown,
            retry_interval,
        })
    }

    pub fn consumer(&self) -> &Consumer<B> {
        &self.consumer
    }

    async fn drop_malformed(&self, entry: &StreamMessage, reason: &str) {
        metrics().messages_dropped_total.inc();
        error!(stream = %entry.stream, id = %entry.id, reason, "failed to handle event, dropping");
        if let Err(err) = self
            .consumer
            .ack(&[(entry.stream.as_str(), entry.id.as_str())])
            .await
        {
            warn!(stream = %entry.stream, id = %entry.id, error = %err, "failed to ack malformed event");
        }
    }
}

fn bytes_field<'a>(entry: &'a StreamMessage, name: &str) -> std::result::Result<&'a [u8], String> {
    match entry.field(name) {
        None => Err(format!("missing {} field", name)),
        Some(value) => value
            .as_bytes()
            .ok_or_else(|| format!("{} field is not a string: {:?}", name, value)),
    }
}

fn into_message(entry: &StreamMessage) -> std::result::Result<Message, String> {
    if entry.field(KEY_FIELD).is_none() || entry.field(VALUE_FIELD).is_none() {
        return Err("missing key or value field".to_string());
    }
    let value = bytes_field(entry, VALUE_FIELD)?;
    let key = bytes_field(entry, KEY_FIELD)?;

    Ok(Message {
        id: MessageId::Entry(entry.id.clone()),
        stream: entry.stream.clone(),
        key: key.to_vec(),
        value: value.to_vec(),
    })
}

#[async_trait]
impl<B: StreamBackend> Stream for RedisStream<B> {
    async fn read(&self, handler: &dyn MessageHandler) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let batch = tokio::select! {
                _ = closed(&mut shutdown) => return Ok(()),
                batch = self.consumer.read() => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    metrics().read_errors_total.inc();
                    error!(error = %err, "failed to read new messages");
                    pause(&mut shutdown, self.retry_interval).await;
                    continue;
                }
            };

            for entry in &batch {
                debug!(stream = %entry.stream, id = %entry.id, "new message");

                let message = match into_message(entry) {
                    Ok(message) => message,
                    Err(reason) => {
                        self.drop_malformed(entry, &reason).await;
                        continue;
                    }
                };
                metrics()
                    .messages_received_total
                    .with_label_values(&[message.stream.as_str()])
                    .inc();

                if let Err(err) = handler.on_message(&message).await {
                    metrics().messages_failed_total.inc();
                    error!(stream = %message.stream, id = %message.id, error = %err, "failed to handle message");
                    if let Err(ack_err) = self.ack(&message).await {
                        warn!(id = %message.id, error = %ack_err, "failed to ack failed message");
                    }
                    return Err(err);
                }

                match self.ack(&message).await {
                    Ok(()) => metrics()
                        .messages_acked_total
                        .with_label_values(&[message.stream.as_str()])
                        .inc(),
                    Err(err) => warn!(id = %message.id, error = %err, "failed to ack message"),
                }
            }
        }
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        match &message.id {
            MessageId::Entry(id) => {
                self.consumer
                    .ack(&[(message.stream.as_str(), id.as_str())])
                    .await?;
                Ok(())
            }
            MessageId::Offset { .. } => Err(CanalError::Stream(StreamError::Configuration(
                format!("message {} is not a stream entry", message.id),
            ))),
        }
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.send_replace(true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis_utils::FieldValue;
    use std::collections::HashMap;

    fn entry(fields: &[(&str, FieldValue)]) -> StreamMessage {
        StreamMessage {
            stream: "chii_members".to_string(),
            id: "5-0".to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn test_well_formed_entry() {
        let message = into_message(&entry(&[
            ("key", FieldValue::from(r#"{"uid":1}"#)),
            ("value", FieldValue::from("")),
        ]))
        .expect("message");

        assert_eq!(message.id, MessageId::Entry("5-0".to_string()));
        assert_eq!(message.key, br#"{"uid":1}"#.to_vec());
        assert!(message.value.is_empty());
    }

    #[test]
    fn test_non_utf8_payload_is_passed_through() {
        let value = vec![b'{', 0xc3, 0x28, b'}'];
        let message = into_message(&entry(&[
            ("key", FieldValue::from(r#"{"uid":1}"#)),
            ("value", FieldValue::from(value.clone())),
        ]))
        .expect("message");

        assert_eq!(message.value, value);
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        assert!(into_message(&entry(&[("key", FieldValue::from("{}"))])).is_err());
        assert!(into_message(&entry(&[("value", FieldValue::from("{}"))])).is_err());
    }

    #[test]
    fn test_non_string_fields_are_malformed() {
        let reason = into_message(&entry(&[
            ("key", FieldValue::from("{}")),
            ("value", FieldValue::Other("int(3)".to_string())),
        ]))
        .unwrap_err();
        assert!(reason.contains("value field is not a string"));

        let reason = into_message(&entry(&[
            ("key", FieldValue::Other("nil".to_string())),
            ("value", FieldValue::from("{}")),
        ]))
        .unwrap_err();
        assert!(reason.contains("key field is not a string"));
    }
}
