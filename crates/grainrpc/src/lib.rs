//! # grainrpc
//!
//! Wire protocol shared by both ends of a remoting connection.
//!
//! ## Philosophy
//!
//! - **Private Protocol**: Frames are serde-encoded JSON. Both ends are built from
//!   this crate, so there is no versioning or schema negotiation.
//! - **Opaque Arguments**: Argument and result payloads are produced by the
//!   interface glue and are carried as opaque bytes.
//! - **Framing is Separate**: `framing` knows about length prefixes, `frame` knows
//!   about messages. Transports that already preserve message boundaries only
//!   need the latter.

pub mod error;
pub mod frame;
pub mod framing;
pub mod payload;

pub use error::FailureReason;
pub use error::RemoteException;
pub use error::Result;
pub use error::RpcError;
pub use frame::ByReferenceHint;
pub use frame::Frame;
pub use frame::ObjectRef;
pub use frame::RejectReason;
pub use framing::DEFAULT_MAX_FRAME_LEN;
pub use framing::read_frame;
pub use framing::write_frame;
pub use payload::Payload;
