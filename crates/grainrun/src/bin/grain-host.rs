//! Worker process for out-of-process silos.
//!
//! Usage: `grain-host <parent-pid> [args...]`. Logs go to stderr; stdout
//! carries the startup lines read by the parent's watchdog.

use anyhow::Context;
use grainrun::host::GrainCatalog;
use grainrun::host::SiloServer;
use grainrun::host::report_exception;
use grainrun::settings::EndpointSettings;
use grainrun::startup;
use grainrun::testing;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let parent_pid = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<u32>())
        .transpose()
        .context("first argument must be the parent process id")?;

    let mut catalog = GrainCatalog::new();
    if let Err(e) = testing::register_all(&mut catalog) {
        report_exception(&e);
        return Err(e.into());
    }

    let mut settings = EndpointSettings::named("grain-host");
    settings.secret = std::env::var(startup::SECRET_ENV).ok();

    SiloServer::new(catalog, settings).with_parent(parent_pid).run().await?;
    Ok(())
}
