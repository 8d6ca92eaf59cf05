//! Pulsar bridge
//!
//! Connects a workflow host to an Apache Pulsar cluster. The crate provides:
//! - Connection construction with no auth, client-certificate TLS or JWT,
//!   including materialization of embedded certificate content into
//!   private temporary files
//! - A publisher that normalizes text, structured or raw payloads into one
//!   message, with optional compression, key and properties
//! - A subscriber trigger running one receive loop per handler, acknowledging
//!   on success and negatively acknowledging on failure so the broker can
//!   redeliver or dead-letter
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pulsar_bridge::{ConnectionFactory, ConnectionSettings, PublishInput, PublishSettings, Publisher};
//!
//! # async fn run() -> Result<(), pulsar_bridge::BridgeError> {
//! let connection = ConnectionFactory::pulsar()
//!     .new_connection(ConnectionSettings::new("local", "pulsar://localhost:6650"))
//!     .await?;
//!
//! let publisher = Publisher::new(&connection, PublishSettings::new("wcntopic")).await?;
//! let output = publisher.publish(PublishInput::text("mary had a little lamb")).await?;
//! println!("published {}", output.msgid);
//!
//! connection.release_connection().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod observability;
pub mod publish;
pub mod testing;
pub mod transport;
pub mod trigger;

pub use config::*;
pub use connection::{ConnectionFactory, PulsarConnection};
pub use credentials::MaterializedCredentials;
pub use error::{BridgeError, BridgeResult};
pub use publish::{PublishInput, PublishOutput, Publisher};
pub use trigger::{LoopExit, Trigger, TriggerHandler, TriggerOutput};
