//! Apache Pulsar implementation of the broker traits
//!
//! - [`options`] - pure mapping from bridge types to `pulsar` crate options
//! - [`client`] - connector, client, producer and consumer wrappers doing the I/O

pub mod client;
pub mod options;

pub use client::{PulsarClient, PulsarConnector, PulsarConsumer, PulsarProducer};
