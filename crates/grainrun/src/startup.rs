//! Line protocol a worker prints on stdout while starting.
//!
//! ```text
//! grain-host: booting
//! 40123
//! grain-host: ready
//! ...
//! grain-host: shutting down
//! ```
//!
//! A worker that fails before it is ready prints a single exception line
//! instead: the marker followed by a base64-encoded exception record.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use grainrpc::RemoteException;

pub const BOOT_MARKER: &str = "grain-host: booting";
pub const READY_MARKER: &str = "grain-host: ready";
pub const SHUTDOWN_MARKER: &str = "grain-host: shutting down";
pub const EXCEPTION_MARKER: &str = "grain-host: exception: ";

/// Environment variable carrying the shared secret to a worker.
pub const SECRET_ENV: &str = "GRAIN_HOST_SECRET";

pub fn exception_line(exception: &RemoteException) -> String {
    let encoded = match serde_json::to_vec(exception) {
        Ok(bytes) => STANDARD.encode(bytes),
        Err(_) => STANDARD.encode(exception.to_string()),
    };
    format!("{}{}", EXCEPTION_MARKER, encoded)
}

/// Decodes an exception line. Returns `None` for any other line.
pub fn parse_exception_line(line: &str) -> Option<RemoteException> {
    let encoded = line.trim_end().strip_prefix(EXCEPTION_MARKER)?;
    let exception = STANDARD
        .decode(encoded)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_else(|| RemoteException::new("UnreadableException", encoded));
    Some(exception)
}
