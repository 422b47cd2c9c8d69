//! Background monitors: the disk-space poller and the tag-index
//! refresher. Both are independent concurrent tasks that publish
//! fire-and-forget updates to the coordinator; neither is authoritative,
//! and neither ever blocks the coordinator on disk I/O.

use std::path::PathBuf;
use std::time::Duration;

use log::{error, warn};

use crate::coordinator::{CoordinatorHandle, Msg};
use crate::tag_index::TagIndex;
use crate::volume;

/// Wrap `body` in a `tokio::spawn` and restart it if it ever terminates
/// (normally or by panic) rather than leaving it dead silently.
fn supervise<F, Fut>(name: &'static str, body: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let handle = tokio::spawn(body());
            match handle.await {
                Ok(()) => {
                    warn!("{} monitor exited unexpectedly, restarting", name);
                }
                Err(err) => {
                    error!("{} monitor panicked ({}), restarting", name, err);
                }
            }
        }
    });
}

/// Start the disk-space monitor: every `interval`, re-discover the volume
/// list under `root` (cheap directory listing; volumes are never removed,
/// only potentially appear between cycles) and measure free/used bytes,
/// publishing survivors to the coordinator.
pub fn spawn_disk_monitor(coordinator: CoordinatorHandle, root: PathBuf, interval: Duration) {
    supervise("disk-space", move || {
        let coordinator = coordinator.clone();
        let root = root.clone();
        async move {
            loop {
                tokio::time::sleep(interval).await;
                match volume::discover(&root) {
                    Ok(known) => {
                        let measured = volume::refresh(&root, &known);
                        coordinator.send(Msg::VolumesUpdate(measured));
                    }
                    Err(err) => {
                        error!("disk-space monitor: volume discovery failed: {}", err);
                    }
                }
            }
        }
    });
}

/// Start the tag-index refresher: every `interval`, rebuild the index from
/// disk and publish it wholesale to the coordinator.
pub fn spawn_tag_monitor(coordinator: CoordinatorHandle, root: PathBuf, interval: Duration) {
    supervise("tag-index", move || {
        let coordinator = coordinator.clone();
        let root = root.clone();
        async move {
            loop {
                tokio::time::sleep(interval).await;
                match volume::discover(&root) {
                    Ok(known) => match TagIndex::build(&root, &known) {
                        Ok(index) => coordinator.send(Msg::TagIndexUpdate(index)),
                        Err(err) => error!("tag-index monitor: build failed: {}", err),
                    },
                    Err(err) => error!("tag-index monitor: volume discovery failed: {}", err),
                }
            }
        }
    });
}
