//! Host handler seam and the output shape handed to it

use crate::transport::InboundMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Failure reported by a host handler; the message is negatively acknowledged
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler receives for each delivered message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerOutput {
    /// Payload as text (lossy for non UTF-8 bytes)
    pub message: String,
    /// Payload parsed as JSON, when it is a JSON object or array
    #[serde(rename = "messageObj", default, skip_serializing_if = "Option::is_none")]
    pub message_obj: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, String>>,
}

impl TriggerOutput {
    pub fn from_message(message: &InboundMessage) -> Self {
        let message_obj = serde_json::from_slice::<Value>(&message.payload)
            .ok()
            .filter(|v| v.is_object() || v.is_array());

        Self {
            message: String::from_utf8_lossy(&message.payload).into_owned(),
            message_obj,
            key: message.key.clone(),
            properties: (!message.properties.is_empty()).then(|| message.properties.clone()),
        }
    }
}

/// Host-supplied message handler.
///
/// Returning `Ok` acknowledges the message; returning `Err` negatively
/// acknowledges it so the broker redelivers it, up to the dead-letter limit.
#[async_trait::async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn handle(&self, output: TriggerOutput) -> Result<(), HandlerError>;
}
