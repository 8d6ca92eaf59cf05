//! Per-handler receive loop
//!
//! One loop drives one consumer: receive, hand the message to the host
//! handler, then ack or nack depending on the outcome. The shutdown signal is
//! only checked between iterations, so a message that has been received is
//! always handled and settled before the loop exits.

use super::handler::{TriggerHandler, TriggerOutput};
use crate::error::BridgeError;
use crate::transport::MessageConsumer;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Why a receive loop ended
#[derive(Debug)]
pub enum LoopExit {
    /// Shutdown was requested and observed between iterations
    Stopped,
    /// The consumer's receive failed (e.g. it was closed)
    ReceiveFailed(BridgeError),
    /// The loop task panicked or was aborted
    Aborted(String),
}

impl LoopExit {
    pub fn is_stopped(&self) -> bool {
        matches!(self, LoopExit::Stopped)
    }
}

/// Run until shutdown is signalled or receive fails
pub async fn run_consume_loop(
    mut consumer: Box<dyn MessageConsumer>,
    handler: Arc<dyn TriggerHandler>,
    shutdown_rx: watch::Receiver<bool>,
) -> LoopExit {
    info!("Consume loop started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let delivery = match consumer.receive().await {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!("Receive failed, stopping consume loop: {}", e.sanitized());
                return LoopExit::ReceiveFailed(e);
            }
        };

        let output = TriggerOutput::from_message(&delivery.message);
        match handler.handle(output).await {
            Ok(()) => {
                if let Err(e) = consumer.ack(&delivery).await {
                    warn!(delivery = delivery.id, "Ack failed: {}", e.sanitized());
                }
            }
            Err(handler_error) => {
                debug!(
                    delivery = delivery.id,
                    "Handler failed, requesting redelivery: {}", handler_error
                );
                if let Err(e) = consumer.nack(&delivery).await {
                    warn!(delivery = delivery.id, "Nack failed: {}", e.sanitized());
                }
            }
        }
    }

    if let Err(e) = consumer.close().await {
        debug!("Consumer close after stop failed: {}", e.sanitized());
    }
    info!("Consume loop stopped");
    LoopExit::Stopped
}
