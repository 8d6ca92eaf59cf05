//! Pure option mapping for the Pulsar backend

use crate::transport::{
    AuthStrategy, CompressionType, DeadLetterPolicy, InitialPosition, SubscriptionType,
};
use ::pulsar::compression::{Compression, CompressionLz4, CompressionZlib, CompressionZstd};
use ::pulsar::consumer::{DeadLetterPolicy as PulsarDeadLetterPolicy, InitialPosition as Position};
use ::pulsar::message::proto::MessageIdData;
use ::pulsar::{Authentication, SubType};

/// Authentication method name for bearer tokens
pub const TOKEN_AUTH_METHOD: &str = "token";
/// Authentication method name for client certificates
pub const TLS_AUTH_METHOD: &str = "tls";

pub fn compression(compression: CompressionType) -> Option<Compression> {
    match compression {
        CompressionType::None => None,
        CompressionType::Lz4 => Some(Compression::Lz4(CompressionLz4::default())),
        CompressionType::Zlib => Some(Compression::Zlib(CompressionZlib::default())),
        CompressionType::Zstd => Some(Compression::Zstd(CompressionZstd::default())),
    }
}

pub fn sub_type(subscription_type: SubscriptionType) -> SubType {
    match subscription_type {
        SubscriptionType::Exclusive => SubType::Exclusive,
        SubscriptionType::Shared => SubType::Shared,
        SubscriptionType::Failover => SubType::Failover,
        SubscriptionType::KeyShared => SubType::KeyShared,
    }
}

pub fn initial_position(position: InitialPosition) -> Position {
    match position {
        InitialPosition::Earliest => Position::Earliest,
        InitialPosition::Latest => Position::Latest,
    }
}

pub fn dead_letter_policy(policy: &DeadLetterPolicy) -> PulsarDeadLetterPolicy {
    PulsarDeadLetterPolicy {
        max_redeliver_count: policy.max_deliveries as usize,
        dead_letter_topic: policy.topic.clone(),
    }
}

/// Build the `pulsar` authentication for a strategy.
///
/// For client certificates the identity is presented during the TLS handshake,
/// so the method only carries its name; the files are read here so a missing
/// or unreadable cert/key fails connection setup instead of the first request.
pub fn authentication(auth: &AuthStrategy) -> std::io::Result<Option<Authentication>> {
    match auth {
        AuthStrategy::None => Ok(None),
        AuthStrategy::Token(token) => Ok(Some(Authentication {
            name: TOKEN_AUTH_METHOD.to_string(),
            data: token.as_bytes().to_vec(),
        })),
        AuthStrategy::Tls {
            cert_path,
            key_path,
        } => {
            std::fs::metadata(cert_path)?;
            std::fs::metadata(key_path)?;
            Ok(Some(Authentication {
                name: TLS_AUTH_METHOD.to_string(),
                data: Vec::new(),
            }))
        }
    }
}

/// Operator-facing caveat for strategies this backend only partly supports.
///
/// The client cannot present a certificate during the TLS handshake, so a
/// broker that enforces TLS authentication will reject the connection.
pub fn auth_limitation(auth: &AuthStrategy) -> Option<&'static str> {
    match auth {
        AuthStrategy::Tls { .. } => Some(
            "client certificate is not presented to the broker; \
             TLS authentication will fail where the broker enforces it",
        ),
        AuthStrategy::None | AuthStrategy::Token(_) => None,
    }
}

/// Serialize a broker message id as ledger, entry, partition and batch index,
/// each big-endian
pub fn message_id_bytes(id: &MessageIdData) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(&id.ledger_id.to_be_bytes());
    bytes.extend_from_slice(&id.entry_id.to_be_bytes());
    bytes.extend_from_slice(&id.partition.unwrap_or(-1).to_be_bytes());
    bytes.extend_from_slice(&id.batch_index.unwrap_or(-1).to_be_bytes());
    bytes
}
