//! Transport layer between the bridge and the message broker
//!
//! The bridge talks to the broker only through the traits in this module so
//! that connection, publish and consume logic can be exercised against the
//! in-memory broker in [`crate::testing`]. The Apache Pulsar implementation
//! lives in [`pulsar`].

use crate::error::BridgeResult;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub mod pulsar;

/// Compression applied by the producer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Zlib,
    Zstd,
}

impl CompressionType {
    /// Resolve the `compressiontype` setting.
    ///
    /// Only the exact values `LZ4`, `ZLIB` and `ZSTD` select a codec; anything
    /// else, including the empty string, means no compression.
    pub fn from_setting(value: &str) -> Self {
        match value {
            "LZ4" => CompressionType::Lz4,
            "ZLIB" => CompressionType::Zlib,
            "ZSTD" => CompressionType::Zstd,
            _ => CompressionType::None,
        }
    }
}

/// Subscription fan-out semantics, enforced by the broker
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubscriptionType {
    #[default]
    #[serde(alias = "")]
    Exclusive,
    Shared,
    Failover,
    KeyShared,
}

/// Where a new subscription starts reading
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum InitialPosition {
    #[default]
    #[serde(alias = "")]
    Earliest,
    Latest,
}

/// Redelivery limit after which the broker routes a message to `topic`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    pub max_deliveries: u32,
    pub topic: String,
}

/// How the client authenticates to the broker
#[derive(Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    None,
    /// Client certificate authentication from PEM files
    Tls { cert_path: PathBuf, key_path: PathBuf },
    /// Bearer token authentication
    Token(String),
}

impl std::fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStrategy::None => write!(f, "None"),
            AuthStrategy::Tls {
                cert_path,
                key_path,
            } => f
                .debug_struct("Tls")
                .field("cert_path", cert_path)
                .field("key_path", key_path)
                .finish(),
            AuthStrategy::Token(_) => write!(f, "Token(<redacted>)"),
        }
    }
}

/// Everything the broker client needs at construction time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Connection name, used in error context
    pub name: String,
    pub url: String,
    pub auth: AuthStrategy,
    /// CA bundle used to verify the broker; system defaults when `None`
    pub trust_certs_path: Option<PathBuf>,
    pub allow_insecure_tls: bool,
    pub validate_hostname: bool,
}

/// Producer construction parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSpec {
    pub topic: String,
    pub compression: CompressionType,
}

/// Consumer construction parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub topic: String,
    pub subscription: String,
    pub subscription_type: SubscriptionType,
    pub initial_position: InitialPosition,
    pub dead_letter: Option<DeadLetterPolicy>,
}

/// Message ready to be sent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub key: Option<String>,
    pub properties: HashMap<String, String>,
}

/// Message as delivered by the broker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub key: Option<String>,
    pub properties: HashMap<String, String>,
}

/// A received message plus the handle used to acknowledge it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub message: InboundMessage,
}

/// Opaque broker-assigned message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub Vec<u8>);

impl MessageId {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex rendering used in publish output and logs
    pub fn to_hex(&self) -> String {
        use std::fmt::Write;
        self.0.iter().fold(String::with_capacity(self.0.len() * 2), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
    }
}

/// Builds broker clients from resolved options
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, options: ClientOptions) -> BridgeResult<Arc<dyn BrokerClient>>;
}

/// Shared broker client handle, safe for concurrent use
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Create a producer bound to one topic
    async fn create_producer(&self, spec: ProducerSpec) -> BridgeResult<Box<dyn MessageProducer>>;

    /// Open one consumer for a subscription
    async fn subscribe(&self, spec: SubscriptionSpec) -> BridgeResult<Box<dyn MessageConsumer>>;

    /// Close the client; pending receives on its consumers fail afterwards
    async fn close(&self);
}

/// Resolves once the broker has persisted an enqueued message
pub type SendReceipt = BoxFuture<'static, BridgeResult<MessageId>>;

#[async_trait::async_trait]
pub trait MessageProducer: Send {
    /// Hand one message to the producer without waiting for the broker.
    ///
    /// Exclusive access is only needed for this step; the returned receipt
    /// can be awaited after the producer is released, so several messages
    /// may be in flight at once.
    async fn enqueue(&mut self, message: OutboundMessage) -> BridgeResult<SendReceipt>;
}

#[async_trait::async_trait]
pub trait MessageConsumer: Send {
    /// Block until the next message arrives
    async fn receive(&mut self) -> BridgeResult<Delivery>;

    /// Remove the message from the subscription backlog
    async fn ack(&mut self, delivery: &Delivery) -> BridgeResult<()>;

    /// Ask the broker to redeliver, subject to the dead-letter policy
    async fn nack(&mut self, delivery: &Delivery) -> BridgeResult<()>;

    async fn close(&mut self) -> BridgeResult<()>;
}
