//! Testing utilities and mock implementations
//!
//! An in-memory broker and a recording handler, so publish, connection and
//! consume behavior can be tested without a running Pulsar cluster.

pub mod mocks;

pub use mocks::*;
