//! Errors and failure descriptions carried across the wire.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Errors produced while encoding, decoding or framing messages.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// An exception raised by a remote subject, reduced to what the caller needs
/// to rebuild an equivalent error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    pub type_name: String,
    pub message: String,
    #[serde(default)]
    pub stack: String,
}

impl RemoteException {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack: String::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    /// Builds an exception from any error value, using its type name.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let mut stack = String::new();
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push_str("caused by: ");
            stack.push_str(&cause.to_string());
            stack.push('\n');
            source = cause.source();
        }
        Self {
            type_name: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
            stack,
        }
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for RemoteException {}

/// Why a call did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// No servant is exported under the requested id, or its subject is gone.
    NoSuchServant { object_id: u64 },
    /// The servant exists but does not implement the requested method.
    NoSuchMethod { interface: String, method: String },
    /// The arguments could not be decoded by the receiver.
    BadArguments { message: String },
    /// The subject raised an exception.
    Exception(RemoteException),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchServant { object_id } => write!(f, "no such servant: {}", object_id),
            Self::NoSuchMethod { interface, method } => {
                write!(f, "no such method: {}.{}", interface, method)
            }
            Self::BadArguments { message } => write!(f, "bad arguments: {}", message),
            Self::Exception(e) => write!(f, "remote exception: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn test_exception_from_error_collects_causes() {
        let error = Outer(std::io::Error::other("disk on fire"));
        let exception = RemoteException::from_error(&error);

        assert!(exception.type_name.ends_with("Outer"));
        assert_eq!(exception.message, "outer");
        assert_eq!(exception.stack, "caused by: disk on fire\n");
    }

    #[test]
    fn test_failure_reason_is_tagged_by_kind() {
        let reason = FailureReason::NoSuchServant { object_id: 7 };
        let json = serde_json::to_value(&reason).unwrap();

        assert_eq!(json["kind"], "no_such_servant");
        assert_eq!(json["object_id"], 7);
    }

    #[test]
    fn test_exception_reason_keeps_all_fields() {
        let reason = FailureReason::Exception(
            RemoteException::new("InvalidOperation", "nope").with_stack("at frame 1"),
        );
        let json = serde_json::to_string(&reason).unwrap();
        let parsed: FailureReason = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, reason);
    }
}
