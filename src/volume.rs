//! Volume registry: discovery, refresh, best-volume selection, and the
//! merge used to apply a disk-space monitor snapshot without losing
//! volumes the monitor failed to measure this cycle.

use std::path::Path;

use log::debug;

use crate::errors::NodeError;
use crate::layout;

const VOLUME_PREFIX: &str = "vol";
const DEFAULT_VOLUME: &str = "vol0";

/// One local storage volume: a `<root>/<name>/{blob,tag}` subtree plus the
/// disk-space readings last observed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub free_bytes: u64,
    pub used_bytes: u64,
}

impl Volume {
    fn new(name: impl Into<String>) -> Self {
        Volume {
            name: name.into(),
            free_bytes: 0,
            used_bytes: 0,
        }
    }
}

/// List entries of `root`, select those whose names begin with `vol`,
/// create `vol0` if none exist, and ensure each selected volume's `blob`
/// and `tag` subdirectories exist. Returns the list sorted by name with
/// free/used initialized to zero.
pub fn discover(root: &Path) -> Result<Vec<Volume>, NodeError> {
    let entries = std::fs::read_dir(root).map_err(|_| NodeError::RootUnreadable(root.to_path_buf()))?;

    let mut names: Vec<String> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|_| NodeError::RootUnreadable(root.to_path_buf()))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(VOLUME_PREFIX) {
                names.push(name.to_string());
            }
        }
    }

    if names.is_empty() {
        debug!("no volumes found under {:?}, creating {}", root, DEFAULT_VOLUME);
        names.push(DEFAULT_VOLUME.to_string());
    }

    names.sort();

    let mut volumes = Vec::with_capacity(names.len());
    for name in names {
        let vol_dir = root.join(&name);
        layout::ensure_dir(&vol_dir.join("blob"))?;
        layout::ensure_dir(&vol_dir.join("tag"))?;
        volumes.push(Volume::new(name));
    }

    Ok(volumes)
}

/// Query free/used bytes for each volume directory under `root`, dropping
/// entries whose query failed. Order is preserved among survivors.
pub fn refresh(root: &Path, volumes: &[Volume]) -> Vec<Volume> {
    volumes
        .iter()
        .filter_map(|vol| {
            let path = root.join(&vol.name);
            match layout::diskspace(&path) {
                Ok((free, used)) => Some(Volume {
                    name: vol.name.clone(),
                    free_bytes: free,
                    used_bytes: used,
                }),
                Err(err) => {
                    debug!("disk-space query failed for {}: {}", vol.name, err);
                    None
                }
            }
        })
        .collect()
}

/// Return the volume with the maximum `free_bytes`. `volumes` must be
/// non-empty (guaranteed by `discover` always producing at least `vol0`);
/// callers that cannot uphold the precondition get an `Internal` error
/// rather than a panic.
pub fn choose_best(volumes: &[Volume]) -> Result<&Volume, NodeError> {
    volumes
        .iter()
        .max_by_key(|vol| vol.free_bytes)
        .ok_or_else(|| NodeError::internal("choose_best called with no volumes"))
}

/// Union `old` and `new` by volume name, preferring `new`'s readings for
/// volumes it lists and keeping `old`'s last-known readings for volumes it
/// omitted (a volume the monitor failed to measure this cycle keeps its
/// prior values rather than vanishing). Order-stable on volume name as it
/// appears in `old`, with any volumes appearing only in `new` appended in
/// their `new` order.
pub fn merge(old: &[Volume], new: &[Volume]) -> Vec<Volume> {
    let mut merged = Vec::with_capacity(old.len().max(new.len()));
    let mut seen = std::collections::HashSet::new();

    for vol in old {
        if let Some(fresh) = new.iter().find(|v| v.name == vol.name) {
            merged.push(fresh.clone());
        } else {
            merged.push(vol.clone());
        }
        seen.insert(vol.name.clone());
    }

    for vol in new {
        if !seen.contains(&vol.name) {
            merged.push(vol.clone());
            seen.insert(vol.name.clone());
        }
    }

    merged
}

/// Sum of free and used bytes across all volumes.
pub fn total_diskspace(volumes: &[Volume]) -> (u64, u64) {
    volumes.iter().fold((0, 0), |(free, used), vol| {
        (free + vol.free_bytes, used + vol.used_bytes)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn discover_creates_default_volume() {
        let root = tempdir().unwrap();
        let volumes = discover(root.path()).unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "vol0");
        assert!(root.path().join("vol0/blob").is_dir());
        assert!(root.path().join("vol0/tag").is_dir());
    }

    #[test]
    fn discover_ignores_non_vol_dirs() {
        let root = tempdir().unwrap();
        std::fs::create_dir(root.path().join("vol1")).unwrap();
        std::fs::create_dir(root.path().join("other")).unwrap();
        let volumes = discover(root.path()).unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "vol1");
    }

    #[test]
    fn discover_sorts_and_is_fatal_on_bad_root() {
        let err = discover(Path::new("/nonexistent/ddfs-root")).unwrap_err();
        assert!(matches!(err, NodeError::RootUnreadable(_)));
    }

    #[test]
    fn choose_best_picks_max_free() {
        let volumes = vec![
            Volume {
                name: "vol0".into(),
                free_bytes: 100,
                used_bytes: 0,
            },
            Volume {
                name: "vol1".into(),
                free_bytes: 500,
                used_bytes: 0,
            },
        ];
        let best = choose_best(&volumes).unwrap();
        assert_eq!(best.name, "vol1");
    }

    #[test]
    fn choose_best_empty_is_internal_error() {
        let err = choose_best(&[]).unwrap_err();
        assert!(matches!(err, NodeError::Internal { .. }));
    }

    #[test]
    fn merge_keeps_omitted_volumes() {
        let old = vec![
            Volume {
                name: "vol0".into(),
                free_bytes: 10,
                used_bytes: 1,
            },
            Volume {
                name: "vol1".into(),
                free_bytes: 20,
                used_bytes: 2,
            },
        ];
        let new = vec![Volume {
            name: "vol0".into(),
            free_bytes: 99,
            used_bytes: 1,
        }];
        let merged = merge(&old, &new);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].free_bytes, 99);
        assert_eq!(merged[1].name, "vol1");
        assert_eq!(merged[1].free_bytes, 20);
    }

    #[test]
    fn total_diskspace_sums() {
        let volumes = vec![
            Volume {
                name: "vol0".into(),
                free_bytes: 10,
                used_bytes: 1,
            },
            Volume {
                name: "vol1".into(),
                free_bytes: 20,
                used_bytes: 2,
            },
        ];
        assert_eq!(total_diskspace(&volumes), (30, 3));
    }
}
