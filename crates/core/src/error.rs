//! Error classes of the engine
//!
//! Composition failures are fatal to the compose call and carry a full
//! diagnostic. Runtime failures travel through the context
//! (`cancel_flow`) rather than unwinding; `ActivationError` is the value
//! form of that channel. Serialization errors are their own class so
//! `Overflow requested` can be told apart from corrupt data.

use thiserror::Error;

/// Fatal composition failure: type mismatch, missing required variable,
/// conflicting exposed variable or invalid parameter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ComposeError {
    pub message: String,
}

impl ComposeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Runtime failure raised from a shard's warmup, activate or cleanup, or
/// from a flow primitive used outside its contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ActivationError {
    pub message: String,
}

impl ActivationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<ComposeError> for ActivationError {
    fn from(e: ComposeError) -> Self {
        ActivationError { message: e.message }
    }
}

/// Parameter introspection/mutation failures on a single shard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardError {
    #[error("invalid parameter index {0}")]
    InvalidParameterIndex(usize),
    #[error("invalid parameter value for index {index}: {reason}")]
    InvalidParameterValue { index: usize, reason: String },
}

/// Serialization failures. `Overflow` is raised by buffer readers when a
/// read exceeds the source length; everything else means the stream is
/// not a valid snapshot for this build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializeError {
    #[error("Overflow requested {requested} bytes, {remaining} remaining")]
    Overflow { requested: usize, remaining: usize },
    #[error("invalid type tag {0}")]
    InvalidTypeTag(u8),
    #[error("unknown shard: {0}")]
    UnknownShard(String),
    #[error("shard hash mismatch for {name}: serialized {serialized:#010x}, current {current:#010x}")]
    ShardHashMismatch { name: String, serialized: u32, current: u32 },
    #[error("wire reference {0:#034x} not found in cache")]
    UnknownWireRef(u128),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("{0}")]
    Shard(String),
}

impl From<SerializeError> for ActivationError {
    fn from(e: SerializeError) -> Self {
        ActivationError { message: e.to_string() }
    }
}

/// Format a caught panic payload into a printable message.
pub fn format_panic_payload(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "foreign exception failure".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_message() {
        let e = SerializeError::Overflow { requested: 16, remaining: 4 };
        assert!(e.to_string().starts_with("Overflow requested"));
    }

    #[test]
    fn test_format_panic_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(format_panic_payload(&payload), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new("owned".to_string());
        assert_eq!(format_panic_payload(&payload), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(format_panic_payload(&payload), "foreign exception failure");
    }
}
