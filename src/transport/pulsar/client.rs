//! I/O side of the Pulsar backend
//!
//! Wraps `pulsar::Pulsar`, producers and consumers behind the bridge's
//! transport traits and converts their errors into [`BridgeError`].

use super::options::{
    auth_limitation, authentication, compression, dead_letter_policy, initial_position,
    message_id_bytes, sub_type,
};
use crate::error::{BridgeError, BridgeResult, TransportCause};
use crate::transport::{
    BrokerClient, BrokerConnector, ClientOptions, Delivery, InboundMessage, MessageConsumer,
    MessageId, MessageProducer, OutboundMessage, ProducerSpec, SendReceipt, SubscriptionSpec,
};
use ::pulsar::consumer::{ConsumerOptions, Message as PulsarMessage};
use ::pulsar::producer::{Message as ProducerMessage, ProducerOptions};
use ::pulsar::{Consumer, Producer, Pulsar, TokioExecutor};
use async_trait::async_trait;
use futures::{FutureExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Creates [`PulsarClient`]s on the tokio executor
#[derive(Debug, Default, Clone, Copy)]
pub struct PulsarConnector;

#[async_trait]
impl BrokerConnector for PulsarConnector {
    async fn connect(&self, options: ClientOptions) -> BridgeResult<Arc<dyn BrokerClient>> {
        let init_error = |message: &str, source: TransportCause| {
            BridgeError::ConnectionInit {
                name: options.name.clone(),
                message: message.to_string(),
                source: Some(source),
            }
        };

        let mut builder = Pulsar::builder(options.url.clone(), TokioExecutor)
            .with_allow_insecure_connection(options.allow_insecure_tls)
            .with_tls_hostname_verification_enabled(options.validate_hostname);

        if let Some(limitation) = auth_limitation(&options.auth) {
            warn!(connection = %options.name, "TLS authentication: {}", limitation);
        }

        let auth = authentication(&options.auth)
            .map_err(|e| init_error("client certificate files are not readable", e.into()))?;
        if let Some(auth) = auth {
            debug!(method = %auth.name, "Using broker authentication");
            builder = builder.with_auth(auth);
        }

        if let Some(ref trust_path) = options.trust_certs_path {
            builder = builder
                .with_certificate_chain_file(trust_path)
                .map_err(|e| init_error("trust certificate chain is not readable", e.into()))?;
        }

        let inner = builder
            .build()
            .await
            .map_err(|e| init_error("broker client construction failed", e.into()))?;

        info!(connection = %options.name, url = %options.url, "Pulsar client created");
        let (closed_tx, _) = watch::channel(false);
        Ok(Arc::new(PulsarClient { inner, closed_tx }))
    }
}

/// Shared Pulsar client handle
///
/// The underlying client has no close operation; closing flips `closed_tx`,
/// which fails new producers and subscriptions and wakes pending receives.
pub struct PulsarClient {
    inner: Pulsar<TokioExecutor>,
    closed_tx: watch::Sender<bool>,
}

impl PulsarClient {
    fn ensure_open(&self) -> Result<(), TransportCause> {
        if *self.closed_tx.borrow() {
            return Err("client is closed".into());
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for PulsarClient {
    async fn create_producer(&self, spec: ProducerSpec) -> BridgeResult<Box<dyn MessageProducer>> {
        let publish_error = |source: TransportCause| BridgeError::Publish {
            topic: spec.topic.clone(),
            source,
        };
        self.ensure_open().map_err(publish_error)?;

        let producer = self
            .inner
            .producer()
            .with_topic(spec.topic.clone())
            .with_options(ProducerOptions {
                compression: compression(spec.compression),
                ..Default::default()
            })
            .build()
            .await
            .map_err(|e| publish_error(e.into()))?;

        debug!(topic = %spec.topic, compression = ?spec.compression, "Producer created");
        Ok(Box::new(PulsarProducer {
            topic: spec.topic,
            inner: producer,
        }))
    }

    async fn subscribe(&self, spec: SubscriptionSpec) -> BridgeResult<Box<dyn MessageConsumer>> {
        let subscribe_error = |source: TransportCause| BridgeError::Subscribe {
            topic: spec.topic.clone(),
            subscription: spec.subscription.clone(),
            source,
        };
        self.ensure_open().map_err(subscribe_error)?;

        let mut builder = self
            .inner
            .consumer()
            .with_topic(spec.topic.clone())
            .with_subscription(spec.subscription.clone())
            .with_subscription_type(sub_type(spec.subscription_type))
            .with_options(ConsumerOptions {
                initial_position: initial_position(spec.initial_position),
                ..Default::default()
            });
        if let Some(ref policy) = spec.dead_letter {
            builder = builder.with_dead_letter_policy(dead_letter_policy(policy));
        }

        let consumer: Consumer<Vec<u8>, TokioExecutor> = builder
            .build()
            .await
            .map_err(|e| subscribe_error(e.into()))?;

        Ok(Box::new(PulsarConsumer {
            topic: spec.topic,
            inner: consumer,
            closed_rx: self.closed_tx.subscribe(),
            pending: HashMap::new(),
            next_delivery: 0,
        }))
    }

    async fn close(&self) {
        if !self.closed_tx.send_replace(true) {
            info!("Pulsar client closed");
        }
    }
}

pub struct PulsarProducer {
    topic: String,
    inner: Producer<TokioExecutor>,
}

#[async_trait]
impl MessageProducer for PulsarProducer {
    async fn enqueue(&mut self, message: OutboundMessage) -> BridgeResult<SendReceipt> {
        let topic = self.topic.clone();
        let outbound = ProducerMessage {
            payload: message.payload,
            properties: message.properties,
            partition_key: message.key,
            ..Default::default()
        };

        let pending = self
            .inner
            .send_non_blocking(outbound)
            .await
            .map_err(|e| BridgeError::Publish {
                topic: topic.clone(),
                source: e.into(),
            })?;

        Ok(async move {
            let receipt = pending.await.map_err(|e| BridgeError::Publish {
                topic,
                source: e.into(),
            })?;
            Ok(MessageId(
                receipt
                    .message_id
                    .as_ref()
                    .map(message_id_bytes)
                    .unwrap_or_default(),
            ))
        }
        .boxed())
    }
}

/// Consumer wrapper tracking in-flight messages until they are acked or nacked
pub struct PulsarConsumer {
    topic: String,
    inner: Consumer<Vec<u8>, TokioExecutor>,
    closed_rx: watch::Receiver<bool>,
    pending: HashMap<u64, PulsarMessage<Vec<u8>>>,
    next_delivery: u64,
}

impl PulsarConsumer {
    fn take_pending(&mut self, delivery: &Delivery) -> BridgeResult<PulsarMessage<Vec<u8>>> {
        self.pending.remove(&delivery.id).ok_or_else(|| BridgeError::Ack {
            topic: self.topic.clone(),
            source: format!("delivery {} is not pending", delivery.id).into(),
        })
    }
}

#[async_trait]
impl MessageConsumer for PulsarConsumer {
    async fn receive(&mut self) -> BridgeResult<Delivery> {
        let mut closed = self.closed_rx.clone();
        let next = tokio::select! {
            next = self.inner.try_next() => next,
            _ = closed.wait_for(|closed| *closed) => {
                return Err(BridgeError::Receive {
                    topic: self.topic.clone(),
                    source: "client is closed".into(),
                })
            }
        };

        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(BridgeError::Receive {
                    topic: self.topic.clone(),
                    source: "consumer stream ended".into(),
                })
            }
            Err(e) => {
                return Err(BridgeError::Receive {
                    topic: self.topic.clone(),
                    source: e.into(),
                })
            }
        };

        let metadata = &message.payload.metadata;
        let inbound = InboundMessage {
            payload: message.payload.data.clone(),
            key: metadata.partition_key.clone(),
            properties: metadata
                .properties
                .iter()
                .map(|kv| (kv.key.clone(), kv.value.clone()))
                .collect(),
        };

        self.next_delivery += 1;
        let id = self.next_delivery;
        self.pending.insert(id, message);
        Ok(Delivery {
            id,
            message: inbound,
        })
    }

    async fn ack(&mut self, delivery: &Delivery) -> BridgeResult<()> {
        let message = self.take_pending(delivery)?;
        self.inner
            .ack(&message)
            .await
            .map_err(|e| BridgeError::Ack {
                topic: self.topic.clone(),
                source: e.into(),
            })
    }

    async fn nack(&mut self, delivery: &Delivery) -> BridgeResult<()> {
        let message = self.take_pending(delivery)?;
        self.inner
            .nack(&message)
            .await
            .map_err(|e| BridgeError::Ack {
                topic: self.topic.clone(),
                source: e.into(),
            })
    }

    async fn close(&mut self) -> BridgeResult<()> {
        if !self.pending.is_empty() {
            warn!(
                topic = %self.topic,
                pending = self.pending.len(),
                "Closing consumer with unacknowledged messages"
            );
        }
        self.inner.close().await.map_err(|e| BridgeError::Receive {
            topic: self.topic.clone(),
            source: e.into(),
        })
    }
}
