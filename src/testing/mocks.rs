//! Mock implementations for testing
//!
//! [`MockBroker`] is an in-memory broker that implements both
//! [`BrokerConnector`] and [`BrokerClient`]. Topics are append-only logs,
//! each subscription keeps its own cursor, and negatively acknowledged
//! messages are redelivered until the dead-letter limit routes them to the
//! dead-letter topic. [`MockHandler`] records what the consume loop hands it.

use crate::error::{BridgeError, BridgeResult};
use crate::transport::{
    BrokerClient, BrokerConnector, ClientOptions, CompressionType, DeadLetterPolicy, Delivery,
    InboundMessage, InitialPosition, MessageConsumer, MessageId, MessageProducer,
    OutboundMessage, ProducerSpec, SendReceipt, SubscriptionSpec,
};
use crate::trigger::{HandlerError, TriggerHandler, TriggerOutput};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// What happened to a message on one subscription, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Received(Vec<u8>),
    Acked(Vec<u8>),
    Nacked(Vec<u8>),
    DeadLettered(Vec<u8>),
}

type SubscriptionKey = (String, String);

#[derive(Default)]
struct SubscriptionState {
    cursor: usize,
    /// Nacked messages with the number of times they were delivered
    redeliver: VecDeque<(InboundMessage, u32)>,
    dead_letter: Option<DeadLetterPolicy>,
    events: Vec<ConsumerEvent>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<InboundMessage>>,
    subscriptions: HashMap<SubscriptionKey, SubscriptionState>,
    producers: Vec<ProducerSpec>,
    connections: Vec<ClientOptions>,
    fail_connect: bool,
    fail_send: bool,
    fail_subscribe: HashSet<String>,
    fail_receive: HashSet<String>,
    send_delay: Option<Duration>,
    send_count: usize,
    close_count: usize,
    closed: bool,
    next_sequence: u64,
}

impl BrokerState {
    fn append(&mut self, topic: &str, message: InboundMessage) -> u64 {
        self.next_sequence += 1;
        self.topics.entry(topic.to_string()).or_default().push(message);
        self.next_sequence
    }

    fn next_delivery(&mut self, key: &SubscriptionKey) -> Option<(InboundMessage, u32)> {
        let log = self.topics.get(&key.0);
        let subscription = self.subscriptions.get_mut(key)?;

        let (message, delivered) = match subscription.redeliver.pop_front() {
            Some(redelivery) => redelivery,
            None => {
                let message = log?.get(subscription.cursor)?.clone();
                subscription.cursor += 1;
                (message, 0)
            }
        };
        subscription
            .events
            .push(ConsumerEvent::Received(message.payload.clone()));
        Some((message, delivered + 1))
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    changed: Notify,
}

/// In-memory broker
#[derive(Clone, Default)]
pub struct MockBroker {
    shared: Arc<Shared>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking test thread must not hide the state from the others
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn fail_send(&self, fail: bool) {
        self.state().fail_send = fail;
    }

    /// Make every subscribe call for `topic` fail
    pub fn fail_subscribe(&self, topic: &str) {
        self.state().fail_subscribe.insert(topic.to_string());
    }

    /// Make pending and future receives on `topic` fail
    pub fn fail_receive(&self, topic: &str) {
        self.state().fail_receive.insert(topic.to_string());
        self.shared.changed.notify_waiters();
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.state().send_delay = delay;
    }

    /// Append a message to a topic as if an outside producer sent it
    pub fn inject(&self, topic: &str, message: InboundMessage) {
        self.state().append(topic, message);
        self.shared.changed.notify_waiters();
    }

    pub fn inject_text(&self, topic: &str, text: &str) {
        self.inject(
            topic,
            InboundMessage {
                payload: text.as_bytes().to_vec(),
                ..Default::default()
            },
        );
    }

    /// Everything written to a topic so far
    pub fn published(&self, topic: &str) -> Vec<InboundMessage> {
        self.state().topics.get(topic).cloned().unwrap_or_default()
    }

    /// Messages routed to a dead-letter topic
    pub fn dead_letters(&self, dlq_topic: &str) -> Vec<InboundMessage> {
        self.published(dlq_topic)
    }

    pub fn events(&self, topic: &str, subscription: &str) -> Vec<ConsumerEvent> {
        self.state()
            .subscriptions
            .get(&(topic.to_string(), subscription.to_string()))
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    fn count_events(&self, topic: &str, subscription: &str, f: fn(&ConsumerEvent) -> bool) -> usize {
        self.events(topic, subscription).iter().filter(|e| f(e)).count()
    }

    pub fn received_count(&self, topic: &str, subscription: &str) -> usize {
        self.count_events(topic, subscription, |e| matches!(e, ConsumerEvent::Received(_)))
    }

    pub fn ack_count(&self, topic: &str, subscription: &str) -> usize {
        self.count_events(topic, subscription, |e| matches!(e, ConsumerEvent::Acked(_)))
    }

    pub fn nack_count(&self, topic: &str, subscription: &str) -> usize {
        self.count_events(topic, subscription, |e| matches!(e, ConsumerEvent::Nacked(_)))
    }

    /// Payloads acknowledged on a subscription
    pub fn acked(&self, topic: &str, subscription: &str) -> Vec<Vec<u8>> {
        self.events(topic, subscription)
            .into_iter()
            .filter_map(|e| match e {
                ConsumerEvent::Acked(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.state().send_count
    }

    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Options passed to the most recent connect call, failed or not
    pub fn last_options(&self) -> Option<ClientOptions> {
        self.state().connections.last().cloned()
    }

    /// Compression chosen by each producer created for `topic`
    pub fn producer_compressions(&self, topic: &str) -> Vec<CompressionType> {
        self.state()
            .producers
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.compression)
            .collect()
    }

    pub fn has_subscription(&self, topic: &str, subscription: &str) -> bool {
        self.state()
            .subscriptions
            .contains_key(&(topic.to_string(), subscription.to_string()))
    }

    /// Poll `condition` until it holds or `timeout` elapses
    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&MockBroker) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(&self, options: ClientOptions) -> BridgeResult<Arc<dyn BrokerClient>> {
        let mut state = self.state();
        let (name, url) = (options.name.clone(), options.url.clone());
        state.connections.push(options);
        if state.fail_connect {
            return Err(BridgeError::ConnectionInit {
                name,
                message: format!("broker unreachable at {url}"),
                source: None,
            });
        }
        state.closed = false;
        drop(state);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn create_producer(&self, spec: ProducerSpec) -> BridgeResult<Box<dyn MessageProducer>> {
        let topic = spec.topic.clone();
        self.state().producers.push(spec);
        Ok(Box::new(MockProducer {
            broker: self.clone(),
            topic,
        }))
    }

    async fn subscribe(&self, spec: SubscriptionSpec) -> BridgeResult<Box<dyn MessageConsumer>> {
        let mut state = self.state();
        if state.closed || state.fail_subscribe.contains(&spec.topic) {
            return Err(BridgeError::Subscribe {
                topic: spec.topic.clone(),
                subscription: spec.subscription.clone(),
                source: "subscription rejected by broker".into(),
            });
        }

        let backlog = state.topics.get(&spec.topic).map_or(0, Vec::len);
        let key = (spec.topic.clone(), spec.subscription.clone());
        let subscription = state.subscriptions.entry(key.clone()).or_default();
        subscription.dead_letter = spec.dead_letter.clone();
        if spec.initial_position == InitialPosition::Latest && subscription.events.is_empty() {
            subscription.cursor = backlog;
        }
        drop(state);

        Ok(Box::new(MockConsumer {
            broker: self.clone(),
            key,
            pending: HashMap::new(),
            next_delivery: 0,
            closed: false,
        }))
    }

    async fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.close_count += 1;
        drop(state);
        self.shared.changed.notify_waiters();
    }
}

/// Producer writing into a [`MockBroker`] topic
pub struct MockProducer {
    broker: MockBroker,
    topic: String,
}

#[async_trait]
impl MessageProducer for MockProducer {
    async fn enqueue(&mut self, message: OutboundMessage) -> BridgeResult<SendReceipt> {
        let delay = {
            let mut state = self.broker.state();
            state.send_count += 1;
            if state.fail_send || state.closed {
                return Err(BridgeError::Publish {
                    topic: self.topic.clone(),
                    source: "producer is not connected".into(),
                });
            }
            state.send_delay
        };

        // The send delay models the broker round trip, so it is spent in the receipt
        let broker = self.broker.clone();
        let topic = self.topic.clone();
        Ok(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let sequence = broker.state().append(
                &topic,
                InboundMessage {
                    payload: message.payload,
                    key: message.key,
                    properties: message.properties,
                },
            );
            broker.shared.changed.notify_waiters();

            // ledger id, entry id
            let mut id = Vec::with_capacity(16);
            id.extend_from_slice(&1u64.to_be_bytes());
            id.extend_from_slice(&sequence.to_be_bytes());
            Ok(MessageId(id))
        }
        .boxed())
    }
}

/// Consumer over one [`MockBroker`] subscription
pub struct MockConsumer {
    broker: MockBroker,
    key: SubscriptionKey,
    pending: HashMap<u64, (InboundMessage, u32)>,
    next_delivery: u64,
    closed: bool,
}

impl MockConsumer {
    fn take_pending(&mut self, delivery: &Delivery) -> BridgeResult<(InboundMessage, u32)> {
        self.pending
            .remove(&delivery.id)
            .ok_or_else(|| BridgeError::Ack {
                topic: self.key.0.clone(),
                source: format!("unknown delivery {}", delivery.id).into(),
            })
    }
}

#[async_trait]
impl MessageConsumer for MockConsumer {
    async fn receive(&mut self) -> BridgeResult<Delivery> {
        loop {
            // Registered before the check so a notify in between is not lost
            let changed = self.broker.shared.changed.notified();
            {
                let mut state = self.broker.state();
                if self.closed || state.closed {
                    return Err(BridgeError::Receive {
                        topic: self.key.0.clone(),
                        source: "consumer closed".into(),
                    });
                }
                if state.fail_receive.contains(&self.key.0) {
                    return Err(BridgeError::Receive {
                        topic: self.key.0.clone(),
                        source: "connection to broker lost".into(),
                    });
                }
                if let Some((message, delivered)) = state.next_delivery(&self.key) {
                    self.next_delivery += 1;
                    let id = self.next_delivery;
                    self.pending.insert(id, (message.clone(), delivered));
                    return Ok(Delivery { id, message });
                }
            }
            changed.await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> BridgeResult<()> {
        let (message, _) = self.take_pending(delivery)?;
        if let Some(subscription) = self.broker.state().subscriptions.get_mut(&self.key) {
            subscription.events.push(ConsumerEvent::Acked(message.payload));
        }
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> BridgeResult<()> {
        let (message, delivered) = self.take_pending(delivery)?;
        {
            let mut state = self.broker.state();
            let Some(subscription) = state.subscriptions.get_mut(&self.key) else {
                return Ok(());
            };
            subscription
                .events
                .push(ConsumerEvent::Nacked(message.payload.clone()));

            let dlq_topic = subscription
                .dead_letter
                .as_ref()
                .filter(|policy| policy.max_deliveries > 0 && delivered >= policy.max_deliveries)
                .map(|policy| policy.topic.clone());

            match dlq_topic {
                Some(topic) => {
                    subscription
                        .events
                        .push(ConsumerEvent::DeadLettered(message.payload.clone()));
                    state.append(&topic, message);
                }
                None => subscription.redeliver.push_back((message, delivered)),
            }
        }
        self.broker.shared.changed.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> BridgeResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// Handler that records every output it receives
#[derive(Clone, Default)]
pub struct MockHandler {
    outputs: Arc<Mutex<Vec<TriggerOutput>>>,
    calls: Arc<AtomicUsize>,
    fail_first: Arc<AtomicUsize>,
    always_fail: bool,
    delay: Option<Duration>,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_failing() -> Self {
        Self {
            always_fail: true,
            ..Default::default()
        }
    }

    /// Fail the first `count` calls, then succeed
    pub fn failing_first(count: usize) -> Self {
        Self {
            fail_first: Arc::new(AtomicUsize::new(count)),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Outputs of calls that succeeded
    pub fn outputs(&self) -> Vec<TriggerOutput> {
        self.outputs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl TriggerHandler for MockHandler {
    async fn handle(&self, output: TriggerOutput) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.always_fail {
            return Err(format!("handler rejected '{}'", output.message).into());
        }
        let failing = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("handler failed transiently".into());
        }

        self.outputs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SubscriptionType;

    fn spec(topic: &str, subscription: &str) -> SubscriptionSpec {
        SubscriptionSpec {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            subscription_type: SubscriptionType::Exclusive,
            initial_position: InitialPosition::Earliest,
            dead_letter: None,
        }
    }

    #[tokio::test]
    async fn test_redelivery_then_dead_letter() {
        let broker = MockBroker::new();
        broker.inject_text("t", "m");
        let mut subscription = spec("t", "s");
        subscription.dead_letter = Some(DeadLetterPolicy {
            max_deliveries: 2,
            topic: "t-dlq".to_string(),
        });
        let mut consumer = broker.subscribe(subscription).await.unwrap();

        let first = consumer.receive().await.unwrap();
        consumer.nack(&first).await.unwrap();
        let second = consumer.receive().await.unwrap();
        assert_eq!(second.message, first.message);
        consumer.nack(&second).await.unwrap();

        assert_eq!(broker.dead_letters("t-dlq").len(), 1);
        assert_eq!(broker.nack_count("t", "s"), 2);
    }

    #[tokio::test]
    async fn test_latest_skips_backlog() {
        let broker = MockBroker::new();
        broker.inject_text("t", "old");
        let mut subscription = spec("t", "s");
        subscription.initial_position = InitialPosition::Latest;
        let mut consumer = broker.subscribe(subscription).await.unwrap();

        broker.inject_text("t", "new");
        let delivery = consumer.receive().await.unwrap();
        assert_eq!(delivery.message.payload, b"new");
    }

    #[tokio::test]
    async fn test_close_fails_pending_receive() {
        let broker = MockBroker::new();
        let mut consumer = broker.subscribe(spec("t", "s")).await.unwrap();

        let closer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            BrokerClient::close(&closer).await;
        });

        assert!(matches!(
            consumer.receive().await,
            Err(BridgeError::Receive { .. })
        ));
    }

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = MockBroker::new();
        broker.inject_text("t", "m");
        let mut consumer = broker.subscribe(spec("t", "s")).await.unwrap();

        let delivery = consumer.receive().await.unwrap();
        consumer.ack(&delivery).await.unwrap();
        assert!(consumer.ack(&delivery).await.is_err());
        assert_eq!(broker.ack_count("t", "s"), 1);
    }

    #[tokio::test]
    async fn test_failing_first_handler() {
        let handler = MockHandler::failing_first(1);
        let output = TriggerOutput::from_message(&InboundMessage::default());
        assert!(handler.handle(output.clone()).await.is_err());
        assert!(handler.handle(output).await.is_ok());
        assert_eq!(handler.calls(), 2);
        assert_eq!(handler.outputs().len(), 1);
    }
}
