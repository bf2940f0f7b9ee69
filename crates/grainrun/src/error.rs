//! Call-time and connect-time errors.

use grainrpc::FailureReason;
use grainrpc::RemoteException;
use grainrpc::RpcError;

use crate::ids::ObjectId;
use crate::transport::TransportError;

/// Errors surfaced to the caller of a remote method.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("not connected")]
    NotConnected,

    /// The connection dropped, was disposed or timed out while the call was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("no such servant: {0}")]
    NoSuchServant(ObjectId),

    #[error("no such method: {interface}.{method}")]
    NoSuchMethod { interface: String, method: String },

    #[error("remote exception: {0}")]
    Remote(RemoteException),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("blocking call issued from inside an async runtime")]
    BlockingInAsyncContext,
}

impl CallError {
    /// Shorthand for subjects raising an application error.
    pub fn remote(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote(RemoteException::new(type_name, message))
    }

    /// True for the errors that mean the remote side is unreachable.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::NotConnected | Self::ConnectionLost(_))
    }

    /// Converts an error raised while serving a call into the reason sent back.
    pub fn into_failure(self) -> FailureReason {
        match self {
            Self::NoSuchServant(id) => FailureReason::NoSuchServant { object_id: id.0 },
            Self::NoSuchMethod { interface, method } => FailureReason::NoSuchMethod { interface, method },
            Self::Remote(exception) => FailureReason::Exception(exception),
            Self::BadArguments(message) | Self::Codec(message) => FailureReason::BadArguments { message },
            other => FailureReason::Exception(RemoteException::new(other.type_name(), other.to_string())),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::NotConnected => "NotConnected",
            Self::ConnectionLost(_) => "ConnectionLost",
            Self::Protocol(_) => "ProtocolViolation",
            Self::BlockingInAsyncContext => "BlockingInAsyncContext",
            _ => "CallError",
        }
    }
}

impl From<FailureReason> for CallError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::NoSuchServant { object_id } => Self::NoSuchServant(ObjectId(object_id)),
            FailureReason::NoSuchMethod { interface, method } => Self::NoSuchMethod { interface, method },
            FailureReason::BadArguments { message } => Self::BadArguments(message),
            FailureReason::Exception(exception) => Self::Remote(exception),
        }
    }
}

impl From<RpcError> for CallError {
    fn from(e: RpcError) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        Self::ConnectionLost(e.to_string())
    }
}

/// Errors raised while establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no endpoint listening at {0}")]
    NoSuchEndpoint(String),

    #[error("remote endpoint requires authentication")]
    AuthenticationRequired,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("endpoint has been disposed")]
    Disposed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reasons_map_to_call_errors() {
        let error: CallError = FailureReason::NoSuchServant { object_id: 4 }.into();
        assert!(matches!(error, CallError::NoSuchServant(ObjectId(4))));

        let error: CallError = FailureReason::Exception(RemoteException::new("Boom", "x")).into();
        assert!(matches!(error, CallError::Remote(e) if e.type_name == "Boom"));
    }

    #[test]
    fn test_connection_errors_travel_as_exceptions() {
        let reason = CallError::ConnectionLost("gone".into()).into_failure();
        let FailureReason::Exception(exception) = reason else {
            panic!("expected exception, got {:?}", reason);
        };
        assert_eq!(exception.type_name, "ConnectionLost");
    }

    #[test]
    fn test_codec_errors_become_bad_arguments() {
        let reason = CallError::Codec("expected u64".into()).into_failure();
        assert_eq!(reason, FailureReason::BadArguments { message: "expected u64".into() });
    }
}
