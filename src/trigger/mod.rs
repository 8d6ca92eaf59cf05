//! Subscriber trigger
//!
//! A [`Trigger`] owns one [`HandlerRuntime`] per configured handler. Each
//! runtime moves through `Subscribed -> Running -> Stopped`:
//!
//! - [`Trigger::initialize`] opens one consumer per [`HandlerSettings`]; a
//!   failed subscription is reported and skipped without affecting the others.
//! - [`Trigger::start`] spawns one independent receive loop per handler.
//! - [`Trigger::stop`] signals every loop; each exits after settling the
//!   message it is currently handling. A loop blocked in receive only notices
//!   once a message arrives or the connection is closed.
//! - [`Trigger::join`] waits for the loops and reports how each one ended.

pub mod consumer_loop;
pub mod handler;

pub use consumer_loop::{run_consume_loop, LoopExit};
pub use handler::{HandlerError, TriggerHandler, TriggerOutput};

use crate::config::HandlerSettings;
use crate::connection::PulsarConnection;
use crate::error::{BridgeError, BridgeResult};
use crate::transport::{BrokerClient, DeadLetterPolicy, MessageConsumer, SubscriptionSpec};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

/// Observable state of one handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Subscribed,
    Running,
    Stopped,
}

enum RuntimeState {
    Subscribed(Box<dyn MessageConsumer>),
    Running(JoinHandle<LoopExit>),
    Stopped(Option<JoinHandle<LoopExit>>),
}

/// One handler, its consumer and its shutdown signal
pub struct HandlerRuntime {
    settings: HandlerSettings,
    handler: Arc<dyn TriggerHandler>,
    state: RuntimeState,
    shutdown_tx: watch::Sender<bool>,
}

impl HandlerRuntime {
    fn new(
        settings: HandlerSettings,
        handler: Arc<dyn TriggerHandler>,
        consumer: Box<dyn MessageConsumer>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            settings,
            handler,
            state: RuntimeState::Subscribed(consumer),
            shutdown_tx,
        }
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    /// `topic/subscription`, used in logs and join results
    pub fn label(&self) -> String {
        format!("{}/{}", self.settings.topic, self.settings.subscription)
    }

    pub fn state(&self) -> HandlerState {
        match self.state {
            RuntimeState::Subscribed(_) => HandlerState::Subscribed,
            RuntimeState::Running(_) => HandlerState::Running,
            RuntimeState::Stopped(_) => HandlerState::Stopped,
        }
    }

    /// Launch the receive loop. Only a subscribed handler can start.
    pub fn start(&mut self) -> bool {
        let previous = std::mem::replace(&mut self.state, RuntimeState::Stopped(None));
        let consumer = match previous {
            RuntimeState::Subscribed(consumer) => consumer,
            other => {
                self.state = other;
                return false;
            }
        };

        let span = crate::consume_span!(
            topic = %self.settings.topic,
            subscription = %self.settings.subscription
        );
        let handle = tokio::spawn(
            run_consume_loop(consumer, self.handler.clone(), self.shutdown_tx.subscribe())
                .instrument(span),
        );
        self.state = RuntimeState::Running(handle);
        true
    }

    /// Ask the loop to exit after its current iteration
    pub fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);
        let previous = std::mem::replace(&mut self.state, RuntimeState::Stopped(None));
        self.state = match previous {
            RuntimeState::Running(handle) => RuntimeState::Stopped(Some(handle)),
            RuntimeState::Subscribed(_) => RuntimeState::Stopped(None),
            stopped @ RuntimeState::Stopped(_) => stopped,
        };
    }

    /// Wait for the loop to finish; `None` if it never ran or was already joined
    pub async fn join(&mut self) -> Option<LoopExit> {
        let handle = match std::mem::replace(&mut self.state, RuntimeState::Stopped(None)) {
            RuntimeState::Running(handle) | RuntimeState::Stopped(Some(handle)) => handle,
            RuntimeState::Stopped(None) => return None,
            subscribed @ RuntimeState::Subscribed(_) => {
                self.state = subscribed;
                return None;
            }
        };

        Some(match handle.await {
            Ok(exit) => exit,
            Err(e) => LoopExit::Aborted(e.to_string()),
        })
    }
}

/// Outcome of [`Trigger::initialize`]
#[derive(Debug, Default)]
pub struct InitializeReport {
    pub subscribed: usize,
    /// Handlers that could not be set up, in configuration order
    pub failures: Vec<BridgeError>,
}

/// Build the consumer parameters for a handler
pub fn subscription_spec(settings: &HandlerSettings) -> SubscriptionSpec {
    let dead_letter = settings.dlq_topic().map(|topic| DeadLetterPolicy {
        max_deliveries: settings.dlq_max_deliveries.unwrap_or(0),
        topic: topic.to_string(),
    });

    SubscriptionSpec {
        topic: settings.topic.clone(),
        subscription: settings.subscription.clone(),
        subscription_type: settings.subscription_type,
        initial_position: settings.initial_position,
        dead_letter,
    }
}

/// Subscriber trigger over one broker connection
pub struct Trigger {
    client: Arc<dyn BrokerClient>,
    handlers: Vec<HandlerRuntime>,
}

impl Trigger {
    pub fn new(connection: &PulsarConnection) -> Self {
        Self::with_client(connection.get_connection())
    }

    pub fn with_client(client: Arc<dyn BrokerClient>) -> Self {
        Self {
            client,
            handlers: Vec::new(),
        }
    }

    /// Subscribe once per handler settings entry
    pub async fn initialize(
        &mut self,
        handlers: Vec<(HandlerSettings, Arc<dyn TriggerHandler>)>,
    ) -> InitializeReport {
        let mut report = InitializeReport::default();

        for (settings, handler) in handlers {
            if let Err(e) = settings.validate() {
                warn!(topic = %settings.topic, "Skipping handler: {}", e);
                report.failures.push(e.into());
                continue;
            }

            let spec = subscription_spec(&settings);
            let span = crate::consume_span!(
                topic = %settings.topic,
                subscription = %settings.subscription
            );
            match self.client.subscribe(spec).instrument(span).await {
                Ok(consumer) => {
                    info!(
                        topic = %settings.topic,
                        subscription = %settings.subscription,
                        subscription_type = ?settings.subscription_type,
                        "Handler subscribed"
                    );
                    self.handlers
                        .push(HandlerRuntime::new(settings, handler, consumer));
                    report.subscribed += 1;
                }
                Err(e) => {
                    warn!("Handler subscription failed: {}", e.sanitized());
                    report.failures.push(e);
                }
            }
        }

        report
    }

    /// Start every subscribed handler; returns how many were started
    pub fn start(&mut self) -> usize {
        let mut started = 0;
        for handler in &mut self.handlers {
            if handler.start() {
                started += 1;
            }
        }
        info!(started, "Trigger started");
        started
    }

    /// Signal every handler to stop
    pub fn stop(&mut self) {
        for handler in &mut self.handlers {
            handler.stop();
        }
        info!("Trigger stop requested");
    }

    /// Wait for every started loop to end
    pub async fn join(&mut self) -> Vec<(String, LoopExit)> {
        let mut exits = Vec::new();
        for handler in &mut self.handlers {
            if let Some(exit) = handler.join().await {
                exits.push((handler.label(), exit));
            }
        }
        exits
    }

    /// Stop and wait, returning an error for the first loop that ended abnormally
    pub async fn shutdown(&mut self) -> BridgeResult<()> {
        self.stop();
        let mut first_error = None;
        for (label, exit) in self.join().await {
            match exit {
                LoopExit::Stopped => {}
                LoopExit::ReceiveFailed(e) => {
                    warn!(handler = %label, "Loop ended on receive failure: {}", e.sanitized());
                    first_error.get_or_insert(e);
                }
                LoopExit::Aborted(reason) => {
                    warn!(handler = %label, "Loop aborted: {}", reason);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn handlers(&self) -> &[HandlerRuntime] {
        &self.handlers
    }

    pub fn handler_mut(&mut self, index: usize) -> Option<&mut HandlerRuntime> {
        self.handlers.get_mut(index)
    }

    pub fn handler_states(&self) -> Vec<HandlerState> {
        self.handlers.iter().map(HandlerRuntime::state).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InitialPosition, SubscriptionType};

    #[test]
    fn test_subscription_spec_without_dlq() {
        let settings = HandlerSettings::new("wcntopic", "wcn-sub");
        let spec = subscription_spec(&settings);

        assert_eq!(spec.topic, "wcntopic");
        assert_eq!(spec.subscription, "wcn-sub");
        assert_eq!(spec.subscription_type, SubscriptionType::Exclusive);
        assert_eq!(spec.initial_position, InitialPosition::Earliest);
        assert_eq!(spec.dead_letter, None);
    }

    #[test]
    fn test_subscription_spec_with_dlq() {
        let mut settings = HandlerSettings::new("wcntopic", "wcn-sub");
        settings.subscription_type = SubscriptionType::Shared;
        settings.initial_position = InitialPosition::Latest;
        settings.dlq_topic = Some("wcntopic-dlq".to_string());
        settings.dlq_max_deliveries = Some(3);

        let spec = subscription_spec(&settings);
        assert_eq!(spec.subscription_type, SubscriptionType::Shared);
        assert_eq!(spec.initial_position, InitialPosition::Latest);
        assert_eq!(
            spec.dead_letter,
            Some(DeadLetterPolicy {
                max_deliveries: 3,
                topic: "wcntopic-dlq".to_string(),
            })
        );
    }
}
