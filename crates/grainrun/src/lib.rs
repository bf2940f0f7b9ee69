//! # grainrun
//!
//! Hosts objects ("grains") in a supervised worker process and calls them
//! through proxies that survive a worker restart.
//!
//! ## Architecture
//!
//! - **Type Classifier** (`typemodel`): decides per type whether values are
//!   copied, shared by reference or resolved as singletons.
//! - **Object Registry** (`registry`): servants exported by an endpoint and
//!   proxies it holds, keyed by [`ObjectId`].
//! - **Call Channel** (`channel`): request/response correlation with
//!   timeouts, plus per-endpoint dispatch queues (`dispatch`).
//! - **Remoting Endpoint** (`endpoint`): handshake, receive loops, routing.
//! - **Heartbeat Monitor** (`heartbeat`): detects a hung peer.
//! - **Process Watchdog** (`watchdog`): spawns the worker and reads its
//!   startup lines.
//! - **Silo** (`silo`, `failure`, `host`): ties the above together and
//!   restarts the worker when it fails.
//!
//! ## Example
//!
//! ```rust,no_run
//! use grainrun::silo::OutOfProcessSilo;
//! use grainrun::settings::SiloSettings;
//! use grainrun::testing::GetPid;
//! use grainrun::testing::ReturnsPid;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let silo = OutOfProcessSilo::new(SiloSettings::for_executable("grain-host"))?;
//! silo.start().await?;
//!
//! let grain = silo.create_grain::<ReturnsPid>(&()).await?;
//! println!("grain lives in {}", grain.get_pid().await?);
//!
//! silo.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod failure;
pub mod heartbeat;
pub mod host;
pub mod ids;
pub mod interface;
pub mod mock_transport;
pub mod proxy;
pub mod registry;
pub mod settings;
pub mod silo;
pub mod startup;
pub mod testing;
pub mod transport;
pub mod typemodel;
pub mod watchdog;

pub use endpoint::EndpointEvent;
pub use endpoint::RemotingEndpoint;
pub use error::CallError;
pub use error::ConnectError;
pub use ids::ConnectionId;
pub use ids::ObjectId;
pub use interface::Dispatch;
pub use interface::Remote;
pub use interface::Subject;
pub use proxy::ProxyHandle;
pub use silo::OutOfProcessSilo;
pub use silo::SiloEvent;

#[cfg(test)]
mod tests;
