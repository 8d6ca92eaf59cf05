//! Publish activity
//!
//! A [`Publisher`] owns one producer for its configured topic. Each call to
//! [`Publisher::publish`] turns a [`PublishInput`] into a single outbound
//! message and returns the broker-assigned id as lowercase hex.
//!
//! Payload precedence: `message` (text) wins over `messageObj` (structured,
//! sent as JSON), which wins over raw bytes. A key is attached whenever the
//! caller provides one, including the empty string; properties only when
//! the map is non-empty. Sends are not retried here.

use crate::config::PublishSettings;
use crate::connection::PulsarConnection;
use crate::error::{BridgeError, BridgeResult};
use crate::transport::{
    BrokerClient, CompressionType, MessageId, MessageProducer, OutboundMessage, ProducerSpec,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn, Instrument};

/// Input of one publish call.
///
/// Older host schemas named the text payload `payload` or `payloadStr` and the
/// structured one `payloadJSON`; those names are accepted as aliases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishInput {
    #[serde(default, alias = "payload", alias = "payloadStr")]
    pub message: Option<String>,
    #[serde(default, rename = "messageObj", alias = "payloadJSON")]
    pub message_obj: Option<Value>,
    /// Raw payload for in-process callers
    #[serde(skip)]
    pub bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub properties: Option<HashMap<String, String>>,
}

impl PublishInput {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn object(message_obj: Value) -> Self {
        Self {
            message_obj: Some(message_obj),
            ..Default::default()
        }
    }

    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Some(bytes),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Output of one publish call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutput {
    /// Broker message id, lowercase hex
    pub msgid: String,
}

/// Resolve the payload bytes following the precedence rules
pub fn resolve_payload(input: &PublishInput) -> BridgeResult<Vec<u8>> {
    if let Some(ref message) = input.message {
        return Ok(message.as_bytes().to_vec());
    }
    if let Some(ref message_obj) = input.message_obj {
        return Ok(message_obj.to_string().into_bytes());
    }
    if let Some(ref bytes) = input.bytes {
        return Ok(bytes.clone());
    }
    Err(BridgeError::PayloadMissing)
}

/// Build the outbound message for an input
pub fn build_message(input: PublishInput) -> BridgeResult<OutboundMessage> {
    let payload = resolve_payload(&input)?;
    Ok(OutboundMessage {
        payload,
        key: input.key,
        properties: input
            .properties
            .filter(|p| !p.is_empty())
            .unwrap_or_default(),
    })
}

/// Producer bound to one topic
pub struct Publisher {
    settings: PublishSettings,
    compression: CompressionType,
    producer: Mutex<Box<dyn MessageProducer>>,
}

impl Publisher {
    pub async fn new(connection: &PulsarConnection, settings: PublishSettings) -> BridgeResult<Self> {
        Self::with_client(connection.get_connection(), settings).await
    }

    pub async fn with_client(
        client: Arc<dyn BrokerClient>,
        settings: PublishSettings,
    ) -> BridgeResult<Self> {
        settings.validate()?;

        let compression = CompressionType::from_setting(&settings.compression_type);
        if compression == CompressionType::None && !settings.compression_type.is_empty() {
            warn!(
                compressiontype = %settings.compression_type,
                "Unrecognized compression type, publishing uncompressed"
            );
        }

        let producer = client
            .create_producer(ProducerSpec {
                topic: settings.topic.clone(),
                compression,
            })
            .instrument(crate::publish_span!(topic = %settings.topic))
            .await?;

        Ok(Self {
            settings,
            compression,
            producer: Mutex::new(producer),
        })
    }

    pub fn topic(&self) -> &str {
        &self.settings.topic
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Publish one message; the payload is resolved before anything is sent
    pub async fn publish(&self, input: PublishInput) -> BridgeResult<PublishOutput> {
        let message = build_message(input)?;
        let message_id = self.send(message).await?;
        let msgid = message_id.to_hex();
        debug!(topic = %self.settings.topic, msgid = %msgid, "Message published");
        Ok(PublishOutput { msgid })
    }

    /// Send a prepared message, bounded by the configured send timeout.
    ///
    /// The producer is locked only while the message is enqueued; the broker
    /// receipt is awaited after the lock is released, so concurrent calls are
    /// pipelined. The timeout starts once this call holds the producer.
    pub async fn send(&self, message: OutboundMessage) -> BridgeResult<MessageId> {
        let timeout = Duration::from_secs(self.settings.send_timeout_secs);
        let span = crate::publish_span!(
            topic = %self.settings.topic,
            bytes = message.payload.len()
        );

        async {
            let (deadline, enqueued) = {
                let mut producer = self.producer.lock().await;
                let deadline = Instant::now() + timeout;
                (deadline, timeout_at(deadline, producer.enqueue(message)).await)
            };
            let receipt = enqueued.map_err(|_| self.timed_out(timeout))??;

            timeout_at(deadline, receipt)
                .await
                .map_err(|_| self.timed_out(timeout))?
        }
        .instrument(span)
        .await
    }

    fn timed_out(&self, timeout: Duration) -> BridgeError {
        BridgeError::Publish {
            topic: self.settings.topic.clone(),
            source: format!("send timed out after {}s", timeout.as_secs()).into(),
        }
    }
}
