//! Failure policy for out-of-process silos.
//!
//! A silo reports every detected [`Fault`] to its [`FailureHandler`] and acts
//! on the returned [`Decision`]. While restarting, each failed start attempt
//! is reported too; the handler decides whether to try again.

use std::fmt;
use std::time::Duration;

use crate::heartbeat::HeartbeatFailure;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The worker stopped answering heartbeats.
    HeartbeatFailure(HeartbeatFailure),
    /// The worker process exited without being asked to.
    HostProcessExited { pid: u32, status: Option<i32> },
    /// The connection to the worker dropped.
    ConnectionFailure(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::HeartbeatFailure(failure) => write!(f, "heartbeat failure: {}", failure),
            Fault::HostProcessExited { pid, status: Some(code) } => write!(f, "worker {} exited with status {}", pid, code),
            Fault::HostProcessExited { pid, status: None } => write!(f, "worker {} was terminated", pid),
            Fault::ConnectionFailure(reason) => write!(f, "connection failure: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the worker down; the silo stays failed.
    Stop,
    /// Kill what is left of the worker and start a new one.
    RestartHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResolution {
    Retry(Duration),
    Stop,
}

pub trait FailureHandler: Send + Sync + 'static {
    fn on_failure(&self, fault: &Fault) -> Decision;

    /// Called after the `attempt`-th (starting at 1) failed start.
    fn on_start_failure(&self, attempt: u32, error: &str) -> StartResolution;

    /// Called once a fault has been handled, whatever the outcome.
    fn on_resolution_finished(&self, _fault: &Fault, _decision: Decision, _restarted: bool) {}
}

/// Restarts the worker on every fault, giving up after a number of failed starts.
#[derive(Debug, Clone)]
pub struct RestartOnFailureStrategy {
    pub max_start_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RestartOnFailureStrategy {
    fn default() -> Self {
        Self {
            max_start_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl FailureHandler for RestartOnFailureStrategy {
    fn on_failure(&self, _fault: &Fault) -> Decision {
        Decision::RestartHost
    }

    fn on_start_failure(&self, attempt: u32, _error: &str) -> StartResolution {
        if attempt < self.max_start_attempts {
            StartResolution::Retry(self.retry_delay)
        } else {
            StartResolution::Stop
        }
    }
}

/// Never restarts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroFailureToleranceStrategy;

impl FailureHandler for ZeroFailureToleranceStrategy {
    fn on_failure(&self, _fault: &Fault) -> Decision {
        Decision::Stop
    }

    fn on_start_failure(&self, _attempt: u32, _error: &str) -> StartResolution {
        StartResolution::Stop
    }
}
