//! # Protocol Frames
//!
//! Every message exchanged over a connection is one `Frame`.
//!
//! ## Connection setup
//!
//! ```text
//! server -> client   Hello    { endpoint, challenge? }
//! client -> server   Login    { endpoint, response? }
//! server -> client   Welcome  { endpoint, connection_id } | Rejected { reason }
//! ```
//!
//! ## Invariants
//! - Every `Call` is answered by exactly one `Result` or `Fault` with the same `rpc_id`.
//! - Every `HeartbeatRequest` is answered by one `HeartbeatResponse` with the same `rpc_id`.
//! - `rpc_id` values are only meaningful to the side that allocated them.

use serde::Deserialize;
use serde::Serialize;

use crate::error::FailureReason;
use crate::error::Result;
use crate::error::RpcError;
use crate::payload::Payload;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        endpoint: String,
        challenge: Option<String>,
    },
    Login {
        endpoint: String,
        response: Option<String>,
    },
    Welcome {
        endpoint: String,
        connection_id: u64,
    },
    Rejected {
        reason: RejectReason,
    },
    Call {
        rpc_id: u64,
        object_id: u64,
        interface: String,
        method: String,
        args: Payload,
    },
    Result {
        rpc_id: u64,
        payload: Payload,
    },
    Fault {
        rpc_id: u64,
        reason: FailureReason,
    },
    HeartbeatRequest {
        rpc_id: u64,
    },
    HeartbeatResponse {
        rpc_id: u64,
    },
    /// Sent by a side that is closing the connection deliberately.
    Goodbye,
}

/// Why the server refused a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AuthenticationRequired,
    AuthenticationFailed,
    Protocol(String),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::Malformed(e.to_string()))
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Login { .. } => "login",
            Self::Welcome { .. } => "welcome",
            Self::Rejected { .. } => "rejected",
            Self::Call { .. } => "call",
            Self::Result { .. } => "result",
            Self::Fault { .. } => "fault",
            Self::HeartbeatRequest { .. } => "heartbeat_request",
            Self::HeartbeatResponse { .. } => "heartbeat_response",
            Self::Goodbye => "goodbye",
        }
    }
}

/// How the receiver should resolve a by-reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByReferenceHint {
    /// The id names an object owned by the sender: create or reuse a proxy.
    CreateProxy,
    /// The id names an object the receiver already owns: use it directly.
    RetrieveSubject,
}

/// Wire form of a by-reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub hint: ByReferenceHint,
    pub object_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteException;

    #[test]
    fn test_call_frame_layout() {
        let frame = Frame::Call {
            rpc_id: 3,
            object_id: 0,
            interface: "SubjectHost".into(),
            method: "create_subject".into(),
            args: Payload::from_bytes(b"null".to_vec()),
        };
        let json: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "call");
        assert_eq!(json["rpc_id"], 3);
        assert_eq!(json["method"], "create_subject");
        assert_eq!(json["args"], "bnVsbA==");
    }

    #[test]
    fn test_fault_frame_carries_exception() {
        let frame = Frame::Fault {
            rpc_id: 9,
            reason: FailureReason::Exception(RemoteException::new("Boom", "it broke")),
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded, frame);
        assert_eq!(decoded.kind(), "fault");
    }

    #[test]
    fn test_unknown_frame_type_is_malformed() {
        let result = Frame::decode(br#"{"type":"gossip","rpc_id":1}"#);
        assert!(matches!(result, Err(RpcError::Malformed(_))));
    }

    #[test]
    fn test_goodbye_has_no_fields() {
        let bytes = Frame::Goodbye.encode().unwrap();
        assert_eq!(bytes, br#"{"type":"goodbye"}"#);
    }

    #[test]
    fn test_object_ref_hint_names() {
        let reference = ObjectRef { hint: ByReferenceHint::RetrieveSubject, object_id: 12 };
        let json = serde_json::to_value(reference).unwrap();

        assert_eq!(json["hint"], "retrieve_subject");
    }
}
