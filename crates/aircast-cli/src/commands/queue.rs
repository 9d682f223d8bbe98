//! Queue administration.
//!
//! There is no RPC surface: a queue is created or reconfigured by writing
//! its descriptor key and deleted by removing it. The running hypercaster
//! reacts through keyspace notifications; these commands work equally well
//! while no daemon runs.

use anyhow::{Context, Result, bail};
use chrono::DateTime;

use aircast_config::AircastConfig;
use aircast_store::Store;
use aircast_types::{QueueDescriptor, QueueName, QueueStatus, keys};

pub fn create(
    config: &AircastConfig,
    name: &str,
    formatter: &str,
    speed: f64,
    start: Option<String>,
    stopped: bool,
) -> Result<()> {
    let name = QueueName::new(name)?;
    if let Some(start) = &start {
        DateTime::parse_from_rfc3339(start)
            .with_context(|| format!("invalid start time '{start}'"))?;
    }
    let mut descriptor = QueueDescriptor::new(name.clone(), formatter);
    descriptor.speed = speed;
    descriptor.starttime = start;
    descriptor.status = if stopped {
        QueueStatus::Stop
    } else {
        QueueStatus::Run
    };

    let mut store = super::connect(config)?;
    store.put_descriptor(&descriptor)?;
    println!("queue '{name}' saved");
    Ok(())
}

pub fn list(config: &AircastConfig) -> Result<()> {
    let mut store = super::connect(config)?;
    let descriptors = store.list_descriptors()?;
    if descriptors.is_empty() {
        println!("no queues declared");
        return Ok(());
    }
    println!(
        "{:<16} {:<12} {:>6}  {:<6} {}",
        "NAME", "FORMATTER", "SPEED", "STATUS", "START"
    );
    for descriptor in descriptors {
        println!(
            "{:<16} {:<12} {:>6.2}  {:<6} {}",
            descriptor.name,
            descriptor.formatter_name,
            descriptor.speed,
            match descriptor.status {
                QueueStatus::Run => "run",
                QueueStatus::Stop => "stop",
            },
            descriptor.starttime.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

pub fn reset(
    config: &AircastConfig,
    name: &str,
    speed: Option<f64>,
    start: Option<String>,
    stop: bool,
    run: bool,
) -> Result<()> {
    let name = QueueName::new(name)?;
    let mut store = super::connect(config)?;
    let Some(mut descriptor) = store.get_descriptor(&name)? else {
        bail!("queue '{name}' does not exist");
    };
    if let Some(speed) = speed {
        descriptor.speed = speed;
    }
    if let Some(start) = start {
        DateTime::parse_from_rfc3339(&start)
            .with_context(|| format!("invalid start time '{start}'"))?;
        descriptor.starttime = Some(start);
    }
    if stop {
        descriptor.status = QueueStatus::Stop;
    } else if run {
        descriptor.status = QueueStatus::Run;
    }
    store.put_descriptor(&descriptor)?;
    println!("queue '{name}' updated");
    Ok(())
}

pub fn delete(config: &AircastConfig, name: &str) -> Result<()> {
    let name = QueueName::new(name)?;
    let mut store = super::connect(config)?;
    // Descriptor first: the hypercaster stops the broadcaster on this
    // delete, then ignores the data key going away.
    store.delete_descriptor(&name)?;
    store.delete_key(&keys::data_key(&name))?;
    println!("queue '{name}' deleted");
    Ok(())
}
