//! `ddfs-node`: the per-node storage service binary.
//!
//! Loads configuration, discovers volumes, builds the initial tag index,
//! spawns the coordinator and both background monitors, and (if enabled)
//! starts the put/get control-plane listeners.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::info;

use ddfs_node::coordinator::NodeCoordinator;
use ddfs_node::{config, monitor, volume};
use ddfs_node::tag_index::TagIndex;

const DEFAULT_CONFIG_PATH: &str = "/etc/ddfs-node/ddfs-node.cfg";

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let cfg = config::load(&config_path)
        .with_context(|| format!("loading configuration from {:?}", config_path))?;

    info!(
        "starting node {:?}, root {:?}, put_max={} get_max={}",
        cfg.nodename, cfg.ddfs_root, cfg.put_max, cfg.get_max
    );

    let root = Path::new(&cfg.ddfs_root).to_path_buf();
    let volumes = volume::discover(&root).context("discovering volumes")?;
    let refreshed = volume::refresh(&root, &volumes);
    let volumes = volume::merge(&volumes, &refreshed);
    let tag_index = TagIndex::build(&root, &volumes).context("building initial tag index")?;

    let coordinator = NodeCoordinator::new(
        cfg.nodename.clone(),
        root.clone(),
        volumes,
        tag_index,
        cfg.put_max,
        cfg.get_max,
        cfg.http_queue_length,
    )
    .spawn();

    monitor::spawn_disk_monitor(coordinator.clone(), root.clone(), cfg.disk_interval);
    monitor::spawn_tag_monitor(coordinator.clone(), root.clone(), cfg.tag_interval);

    if cfg.put_enabled {
        let addr = format!("0.0.0.0:{}", cfg.put_port).parse()?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move { ddfs_node::http::serve(addr, coordinator).await });
    }
    if cfg.get_enabled {
        let addr = format!("0.0.0.0:{}", cfg.get_port).parse()?;
        tokio::spawn(async move { ddfs_node::http::serve(addr, coordinator).await });
    }

    // The coordinator and monitors run as detached tasks; keep the
    // process alive until explicitly signaled.
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    Ok(())
}
