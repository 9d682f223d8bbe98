//! The `start` command: run the hypercaster until interrupted.

use anyhow::{Context, Result};
use tracing::{info, warn};

use aircast_broadcast::{Hypercaster, HypercasterOptions, LiveFeedTarget};
use aircast_config::AircastConfig;
use aircast_types::QueueName;

pub fn run(config: &AircastConfig) -> Result<()> {
    let store = super::connect(config)?;

    let mut default_queues = Vec::new();
    for (name, formatter) in &config.queues.defaults {
        match QueueName::new(name.clone()) {
            Ok(name) => default_queues.push((name, formatter.clone())),
            Err(e) => warn!(name, error = %e, "ignoring default queue"),
        }
    }

    let options = HypercasterOptions {
        heartbeat: config.broadcast.heartbeat,
        live_feed: config.livetraffic.enabled.then(|| LiveFeedTarget {
            host: config.livetraffic.host.clone(),
            port: config.livetraffic.port,
        }),
        default_queues,
    };

    let handle =
        Hypercaster::start(Box::new(store), options).context("starting the hypercaster")?;
    info!("aircast running, press Ctrl-C to stop");

    wait_for_interrupt()?;

    info!("interrupt received, shutting down");
    handle.stop();
    info!("bye");
    Ok(())
}

#[cfg(unix)]
fn wait_for_interrupt() -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handlers")?;
    // Blocks until the first termination signal arrives.
    let _ = signals.forever().next();
    Ok(())
}

#[cfg(windows)]
fn wait_for_interrupt() -> Result<()> {
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("installing Ctrl-C handler")?;
    let _ = rx.recv();
    Ok(())
}
