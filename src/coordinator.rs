//! The node coordinator: the single serialization point owning the volume
//! registry, both admission queues, the tag index, and node identity.
//!
//! Implemented as one long-lived `tokio` task driven by an unbounded
//! `mpsc` channel of [`Msg`], the async-Rust analogue of a `gen_server`
//! actor generalized to a long-lived process rather than a per-request
//! worker. All state mutation happens inside [`run`]; nothing outside this
//! module ever touches `volumes`, the queues, or `tag_index` directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::errors::NodeError;
use crate::layout::{self, ObjectKind};
use crate::queue::{AddResult, AdmissionQueue};
use crate::tag_index::{TagEntry, TagIndex, Timestamp};
use crate::volume::{self, Volume};

/// Identifies one admitted client across its admission lifetime. Death of
/// the handle (see `ClientGuard` in [`crate::http`]) is the sole
/// cancellation signal the admission queues understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(u64);

impl ClientHandle {
    pub fn new(id: u64) -> Self {
        ClientHandle(id)
    }
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh, never-reused client handle.
pub fn next_handle() -> ClientHandle {
    ClientHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

pub type PutBlobReply = Result<(PathBuf, String), NodeError>;
pub type GetBlobReply = Result<(), NodeError>;
pub type TagDataReply = Result<Vec<u8>, NodeError>;
pub type TagWriteReply = Result<String, NodeError>;

/// Messages the coordinator understands. One variant per request kind,
/// plus the two monitor casts and the handle-death signal.
pub enum Msg {
    GetTags {
        reply: oneshot::Sender<Vec<String>>,
    },
    GetVols {
        reply: oneshot::Sender<(Vec<Volume>, PathBuf)>,
    },
    GetDiskspace {
        reply: oneshot::Sender<(u64, u64)>,
    },
    GetBlob {
        handle: ClientHandle,
        reply: oneshot::Sender<GetBlobReply>,
    },
    PutBlob {
        handle: ClientHandle,
        blob_name: String,
        reply: oneshot::Sender<PutBlobReply>,
    },
    GetTagTimestamp {
        tag_name: String,
        reply: oneshot::Sender<Option<(u64, String)>>,
    },
    GetTagData {
        objname: String,
        volume: String,
        reply: oneshot::Sender<TagDataReply>,
    },
    PutTagData {
        objname: String,
        data: Vec<u8>,
        reply: oneshot::Sender<TagWriteReply>,
    },
    PutTagCommit {
        objname: String,
        commit_map: HashMap<String, String>,
        reply: oneshot::Sender<TagWriteReply>,
    },
    VolumesUpdate(Vec<Volume>),
    TagIndexUpdate(TagIndex),
    HandleDied(ClientHandle),
}

/// A cloneable front end for sending messages to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Msg>,
}

impl CoordinatorHandle {
    pub fn send(&self, msg: Msg) {
        // The channel is unbounded (monitor casts are fire-and-forget and
        // cannot observe backpressure), so the only way this fails is the
        // coordinator task having already exited, which is a fatal
        // internal error for the whole process.
        if self.tx.send(msg).is_err() {
            error!("coordinator channel closed; node is no longer functional");
        }
    }
}

pub struct NodeCoordinator {
    node_name: String,
    ddfs_root: PathBuf,
    volumes: Vec<Volume>,
    put_queue: AdmissionQueue,
    get_queue: AdmissionQueue,
    tag_index: TagIndex,
}

impl NodeCoordinator {
    pub fn new(
        node_name: String,
        ddfs_root: PathBuf,
        volumes: Vec<Volume>,
        tag_index: TagIndex,
        put_max: usize,
        get_max: usize,
        max_waiting: usize,
    ) -> Self {
        NodeCoordinator {
            node_name,
            ddfs_root,
            volumes,
            put_queue: AdmissionQueue::new(put_max, max_waiting),
            get_queue: AdmissionQueue::new(get_max, max_waiting),
            tag_index,
        }
    }

    /// Spawn the coordinator as a `tokio` task and return a handle for
    /// sending it messages.
    pub fn spawn(self) -> CoordinatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx));
        CoordinatorHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        info!(
            "coordinator started for node {:?}, root {:?}, {} volumes",
            self.node_name,
            self.ddfs_root,
            self.volumes.len()
        );
        while let Some(msg) = rx.recv().await {
            self.handle(msg);
        }
        warn!("coordinator message channel closed, stopping");
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::GetTags { reply } => {
                let _ = reply.send(self.tag_index.keys().cloned().collect());
            }
            Msg::GetVols { reply } => {
                let _ = reply.send((self.volumes.clone(), self.ddfs_root.clone()));
            }
            Msg::GetDiskspace { reply } => {
                let _ = reply.send(volume::total_diskspace(&self.volumes));
            }
            Msg::GetBlob { handle, reply } => self.handle_get_blob(handle, reply),
            Msg::PutBlob {
                handle,
                blob_name,
                reply,
            } => self.handle_put_blob(handle, blob_name, reply),
            Msg::GetTagTimestamp { tag_name, reply } => {
                let result = self
                    .tag_index
                    .lookup(&tag_name)
                    .map(|entry| (entry.timestamp.0, entry.volume.clone()));
                let _ = reply.send(result);
            }
            Msg::GetTagData {
                objname,
                volume,
                reply,
            } => self.handle_get_tag_data(objname, volume, reply),
            Msg::PutTagData { objname, data, reply } => self.handle_put_tag_data(objname, data, reply),
            Msg::PutTagCommit {
                objname,
                commit_map,
                reply,
            } => self.handle_put_tag_commit(objname, commit_map, reply),
            Msg::VolumesUpdate(snapshot) => {
                self.volumes = volume::merge(&self.volumes, &snapshot);
                debug!("volume registry merged, {} volumes known", self.volumes.len());
            }
            Msg::TagIndexUpdate(fresh) => {
                debug!("tag index refreshed, {} tags known", fresh.len());
                self.tag_index = fresh;
            }
            Msg::HandleDied(handle) => {
                self.put_queue.remove(handle);
                self.get_queue.remove(handle);
            }
        }
    }

    fn handle_get_blob(&mut self, handle: ClientHandle, reply: oneshot::Sender<GetBlobReply>) {
        if self.get_queue.is_full() {
            let _ = reply.send(Err(NodeError::Full));
            return;
        }
        let action: crate::queue::Action = Box::new(move || {
            let _ = reply.send(Ok(()));
        });
        let result = self.get_queue.add(handle, action);
        debug_assert_ne!(result, AddResult::Full);
    }

    fn handle_put_blob(&mut self, handle: ClientHandle, blob_name: String, reply: oneshot::Sender<PutBlobReply>) {
        if self.put_queue.is_full() {
            let _ = reply.send(Err(NodeError::Full));
            return;
        }
        let node_name = self.node_name.clone();
        let root = self.ddfs_root.clone();
        let volumes = self.volumes.clone();
        let action: crate::queue::Action = Box::new(move || {
            let result = (|| -> PutBlobReply {
                let best = volume::choose_best(&volumes)?;
                let (local, url) = layout::hashdir(&blob_name, &node_name, ObjectKind::Blob, &root, &best.name);
                let parent = local
                    .parent()
                    .ok_or_else(|| NodeError::internal(format!("hashdir produced a path with no parent: {:?}", local)))?;
                layout::ensure_dir(parent)?;
                Ok((local, url))
            })();
            let _ = reply.send(result);
        });
        let result = self.put_queue.add(handle, action);
        debug_assert_ne!(result, AddResult::Full);
    }

    fn handle_get_tag_data(&mut self, objname: String, volume: String, reply: oneshot::Sender<TagDataReply>) {
        let node_name = self.node_name.clone();
        let root = self.ddfs_root.clone();
        // Spawned off the coordinator task so disk latency never blocks
        // the serialization point.
        tokio::spawn(async move {
            let (path, _url) = layout::hashdir(&objname, &node_name, ObjectKind::Tag, &root, &volume);
            let result = tokio::fs::read(&path).await.map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    NodeError::NotFound
                } else {
                    NodeError::io("read", &path, err)
                }
            });
            let _ = reply.send(result);
        });
    }

    fn handle_put_tag_data(&mut self, objname: String, data: Vec<u8>, reply: oneshot::Sender<TagWriteReply>) {
        let result = (|| -> TagWriteReply {
            let best = volume::choose_best(&self.volumes)?;
            let volume_name = best.name.clone();
            let (committed_path, _url) =
                layout::hashdir(&objname, &self.node_name, ObjectKind::Tag, &self.ddfs_root, &volume_name);
            let parent = committed_path.parent().ok_or_else(|| {
                NodeError::internal(format!(
                    "hashdir produced a path with no parent: {:?}",
                    committed_path
                ))
            })?;
            layout::ensure_dir(parent)?;
            let partial_path = committed_path.with_file_name(layout::partial_name(&objname));
            std::fs::write(&partial_path, &data).map_err(|err| NodeError::io("write", &partial_path, err))?;
            Ok(volume_name)
        })();
        let _ = reply.send(result);
    }

    fn handle_put_tag_commit(
        &mut self,
        objname: String,
        commit_map: HashMap<String, String>,
        reply: oneshot::Sender<TagWriteReply>,
    ) {
        let result = (|| -> TagWriteReply {
            let volume_name = commit_map.get(&self.node_name).cloned().ok_or_else(|| {
                let detail = format!(
                    "commit_map for tag {:?} does not name this node ({:?})",
                    objname, self.node_name
                );
                error!("{}", detail);
                NodeError::internal(detail)
            })?;

            let (committed_path, url) =
                layout::hashdir(&objname, &self.node_name, ObjectKind::Tag, &self.ddfs_root, &volume_name);
            let partial_path = committed_path.with_file_name(layout::partial_name(&objname));

            layout::safe_rename(&partial_path, &committed_path)?;

            let (tag_name, timestamp) = layout::unpack_objname(&objname)?;
            self.tag_index.replace(
                tag_name,
                TagEntry {
                    timestamp: Timestamp(timestamp),
                    volume: volume_name,
                },
            );
            Ok(url)
        })();

        if let Err(ref err) = result {
            error!("put_tag_commit failed for {:?}: {}", objname, err);
        }
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_coordinator(root: PathBuf, put_max: usize, max_waiting: usize) -> NodeCoordinator {
        let volumes = volume::discover(&root).unwrap();
        let tag_index = TagIndex::build(&root, &volumes).unwrap();
        NodeCoordinator::new(
            "node0".to_string(),
            root,
            volumes,
            tag_index,
            put_max,
            max_waiting.max(put_max),
            max_waiting,
        )
    }

    // S1: put-blob under capacity.
    #[test]
    fn s1_put_blob_under_capacity() {
        let root = tempdir().unwrap();
        let mut coord = new_coordinator(root.path().to_path_buf(), 2, 2);

        let (tx, mut rx) = oneshot::channel();
        coord.handle(Msg::PutBlob {
            handle: next_handle(),
            blob_name: "b1".to_string(),
            reply: tx,
        });

        let (local, _url) = rx.try_recv().unwrap().unwrap();
        assert!(local.exists() || local.parent().unwrap().is_dir());
        assert!(local.starts_with(root.path().join("vol0").join("blob")));
    }

    // S2 + S3: overflow then a dead handle promotes the waiter.
    #[test]
    fn s2_s3_overflow_then_promotion_on_death() {
        let root = tempdir().unwrap();
        let mut coord = new_coordinator(root.path().to_path_buf(), 1, 1);

        let a = next_handle();
        let b = next_handle();
        let c = next_handle();

        let (tx_a, mut rx_a) = oneshot::channel();
        coord.handle(Msg::PutBlob {
            handle: a,
            blob_name: "a".to_string(),
            reply: tx_a,
        });
        assert!(rx_a.try_recv().unwrap().is_ok());

        let (tx_b, mut rx_b) = oneshot::channel();
        coord.handle(Msg::PutBlob {
            handle: b,
            blob_name: "b".to_string(),
            reply: tx_b,
        });
        assert!(rx_b.try_recv().is_err(), "B should still be waiting");

        let (tx_c, mut rx_c) = oneshot::channel();
        coord.handle(Msg::PutBlob {
            handle: c,
            blob_name: "c".to_string(),
            reply: tx_c,
        });
        assert!(matches!(rx_c.try_recv().unwrap(), Err(NodeError::Full)));

        coord.handle(Msg::HandleDied(a));
        assert!(rx_b.try_recv().unwrap().is_ok(), "B should now have run");
    }

    // S4: tag write-then-commit round trip.
    #[test]
    fn s4_tag_commit_round_trip() {
        let root = tempdir().unwrap();
        let mut coord = new_coordinator(root.path().to_path_buf(), 2, 2);

        let (tx, mut rx) = oneshot::channel();
        coord.handle(Msg::PutTagData {
            objname: "mytag+100".to_string(),
            data: b"hello".to_vec(),
            reply: tx,
        });
        assert_eq!(rx.try_recv().unwrap().unwrap(), "vol0");

        let mut commit_map = HashMap::new();
        commit_map.insert("node0".to_string(), "vol0".to_string());
        let (tx, mut rx) = oneshot::channel();
        coord.handle(Msg::PutTagCommit {
            objname: "mytag+100".to_string(),
            commit_map,
            reply: tx,
        });
        assert!(rx.try_recv().unwrap().is_ok());

        let (tx, mut rx) = oneshot::channel();
        coord.handle(Msg::GetTagTimestamp {
            tag_name: "mytag".to_string(),
            reply: tx,
        });
        let (ts, vol) = rx.try_recv().unwrap().unwrap();
        assert_eq!(ts, 100);
        assert_eq!(vol, "vol0");
    }

    #[tokio::test]
    async fn s4_get_tag_data_reads_committed_bytes() {
        let root = tempdir().unwrap();
        let mut coord = new_coordinator(root.path().to_path_buf(), 2, 2);

        let (tx, mut rx) = oneshot::channel();
        coord.handle(Msg::PutTagData {
            objname: "mytag+100".to_string(),
            data: b"hello".to_vec(),
            reply: tx,
        });
        rx.try_recv().unwrap().unwrap();

        let mut commit_map = HashMap::new();
        commit_map.insert("node0".to_string(), "vol0".to_string());
        let (tx, mut rx) = oneshot::channel();
        coord.handle(Msg::PutTagCommit {
            objname: "mytag+100".to_string(),
            commit_map,
            reply: tx,
        });
        rx.try_recv().unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        coord.handle(Msg::GetTagData {
            objname: "mytag+100".to_string(),
            volume: "vol0".to_string(),
            reply: tx,
        });
        let data = rx.await.unwrap().unwrap();
        assert_eq!(data, b"hello");
    }

    // S5: newer overrides older on scan.
    #[test]
    fn s5_newer_wins_on_rebuild() {
        let root = tempdir().unwrap();
        volume::discover(root.path()).unwrap();
        std::fs::create_dir_all(root.path().join("vol1")).unwrap();
        layout::ensure_dir(&root.path().join("vol1").join("blob")).unwrap();
        layout::ensure_dir(&root.path().join("vol1").join("tag")).unwrap();

        let dir0 = root.path().join("vol0").join("tag").join("aa").join("bb");
        std::fs::create_dir_all(&dir0).unwrap();
        std::fs::write(dir0.join("mytag+50"), b"old").unwrap();

        let dir1 = root.path().join("vol1").join("tag").join("aa").join("bb");
        std::fs::create_dir_all(&dir1).unwrap();
        std::fs::write(dir1.join("mytag+70"), b"new").unwrap();

        let volumes = volume::discover(root.path()).unwrap();
        let fresh = TagIndex::build(root.path(), &volumes).unwrap();
        let mut coord = new_coordinator(root.path().to_path_buf(), 2, 2);
        coord.handle(Msg::TagIndexUpdate(fresh));

        let (tx, mut rx) = oneshot::channel();
        coord.handle(Msg::GetTagTimestamp {
            tag_name: "mytag".to_string(),
            reply: tx,
        });
        let (ts, vol) = rx.try_recv().unwrap().unwrap();
        assert_eq!(ts, 70);
        assert_eq!(vol, "vol1");
    }

    // S6: volume choice picks the volume with the most free space.
    #[test]
    fn s6_put_blob_picks_best_volume() {
        let root = tempdir().unwrap();
        let mut coord = new_coordinator(root.path().to_path_buf(), 2, 2);
        coord.handle(Msg::VolumesUpdate(vec![
            Volume {
                name: "vol0".to_string(),
                free_bytes: 100,
                used_bytes: 0,
            },
            Volume {
                name: "vol1".to_string(),
                free_bytes: 500,
                used_bytes: 0,
            },
        ]));

        let (tx, mut rx) = oneshot::channel();
        coord.handle(Msg::PutBlob {
            handle: next_handle(),
            blob_name: "b".to_string(),
            reply: tx,
        });
        let (local, _url) = rx.try_recv().unwrap().unwrap();
        assert!(local.starts_with(root.path().join("vol1").join("blob")));
    }

    #[test]
    fn commit_failure_leaves_index_untouched() {
        let root = tempdir().unwrap();
        let mut coord = new_coordinator(root.path().to_path_buf(), 2, 2);

        // No put_tag_data happened, so there is no partial file to rename;
        // the commit must fail and the index must stay empty.
        let mut commit_map = HashMap::new();
        commit_map.insert("node0".to_string(), "vol0".to_string());
        let (tx, mut rx) = oneshot::channel();
        coord.handle(Msg::PutTagCommit {
            objname: "ghost+1".to_string(),
            commit_map,
            reply: tx,
        });
        assert!(rx.try_recv().unwrap().is_err());

        let (tx, mut rx) = oneshot::channel();
        coord.handle(Msg::GetTagTimestamp {
            tag_name: "ghost".to_string(),
            reply: tx,
        });
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn commit_missing_from_map_is_internal_error() {
        let root = tempdir().unwrap();
        let mut coord = new_coordinator(root.path().to_path_buf(), 2, 2);

        let (tx, mut rx) = oneshot::channel();
        coord.handle(Msg::PutTagCommit {
            objname: "mytag+1".to_string(),
            commit_map: HashMap::new(),
            reply: tx,
        });
        assert!(matches!(rx.try_recv().unwrap(), Err(NodeError::Internal { .. })));
    }
}
