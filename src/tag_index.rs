//! Tag index: an in-memory cache mapping `tag_name -> (timestamp, volume)`,
//! newest timestamp wins. Rebuilt from disk at startup and on every
//! periodic refresh; authoritatively updated by a successful commit in
//! between rebuilds.

use std::collections::HashMap;
use std::path::Path;

use log::debug;

use crate::errors::NodeError;
use crate::layout;
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub timestamp: Timestamp,
    pub volume: String,
}

/// `tag_name -> TagEntry`. Keys are unique; iteration order is
/// unspecified and irrelevant.
#[derive(Debug, Clone, Default)]
pub struct TagIndex {
    entries: HashMap<String, TagEntry>,
}

impl TagIndex {
    pub fn new() -> Self {
        TagIndex {
            entries: HashMap::new(),
        }
    }

    pub fn lookup(&self, tag_name: &str) -> Option<&TagEntry> {
        self.entries.get(tag_name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Unconditional set, used on commit: by the time this is called the
    /// coordinator has already verified newness via the successful rename.
    pub fn replace(&mut self, tag_name: String, entry: TagEntry) {
        self.entries.insert(tag_name, entry);
    }

    /// Walk every volume's `tag/` subtree, parse each non-partial
    /// filename into `(tag_name, timestamp)`, and fold into a fresh index
    /// keeping, per tag name, the entry with the strictly greatest
    /// timestamp.
    pub fn build(root: &Path, volumes: &[Volume]) -> Result<TagIndex, NodeError> {
        let mut index = TagIndex::new();
        let mut observed = 0usize;

        for vol in volumes {
            let tag_dir = root.join(&vol.name).join("tag");
            let vol_name = vol.name.clone();

            layout::walk_files(&tag_dir, |name, _path| {
                if layout::is_partial(name) {
                    return;
                }
                let (tag_name, ts) = match layout::unpack_objname(name) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        debug!("skipping malformed tag object {:?}: {}", name, err);
                        return;
                    }
                };
                let timestamp = Timestamp(ts);
                let replace = match index.entries.get(&tag_name) {
                    None => true,
                    Some(existing) => timestamp > existing.timestamp,
                };
                if replace {
                    index.entries.insert(
                        tag_name,
                        TagEntry {
                            timestamp,
                            volume: vol_name.clone(),
                        },
                    );
                }
                observed += 1;
            })?;
        }

        debug!(
            "tag index rebuilt: {} distinct tags from {} on-disk objects",
            index.len(),
            observed
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Volume;
    use tempfile::tempdir;

    fn vol(name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            free_bytes: 0,
            used_bytes: 0,
        }
    }

    fn touch(root: &Path, vol: &str, name: &str) {
        let dir = root.join(vol).join("tag").join("aa").join("bb");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn newest_timestamp_wins_across_volumes() {
        let root = tempdir().unwrap();
        touch(root.path(), "vol0", "mytag+50");
        touch(root.path(), "vol1", "mytag+70");

        let volumes = vec![vol("vol0"), vol("vol1")];
        let index = TagIndex::build(root.path(), &volumes).unwrap();

        let entry = index.lookup("mytag").unwrap();
        assert_eq!(entry.timestamp, Timestamp(70));
        assert_eq!(entry.volume, "vol1");
    }

    #[test]
    fn partial_files_are_excluded() {
        let root = tempdir().unwrap();
        touch(root.path(), "vol0", "!partial.mytag+999");
        touch(root.path(), "vol0", "mytag+10");

        let volumes = vec![vol("vol0")];
        let index = TagIndex::build(root.path(), &volumes).unwrap();

        let entry = index.lookup("mytag").unwrap();
        assert_eq!(entry.timestamp, Timestamp(10));
    }

    #[test]
    fn crashed_commit_is_invisible() {
        let root = tempdir().unwrap();
        touch(root.path(), "vol0", "!partial.mytag+999");

        let volumes = vec![vol("vol0")];
        let index = TagIndex::build(root.path(), &volumes).unwrap();

        assert!(index.lookup("mytag").is_none());
        assert_eq!(index.keys().count(), 0);
    }

    #[test]
    fn replace_is_unconditional() {
        let mut index = TagIndex::new();
        index.replace(
            "mytag".to_string(),
            TagEntry {
                timestamp: Timestamp(5),
                volume: "vol0".to_string(),
            },
        );
        index.replace(
            "mytag".to_string(),
            TagEntry {
                timestamp: Timestamp(1),
                volume: "vol1".to_string(),
            },
        );
        let entry = index.lookup("mytag").unwrap();
        assert_eq!(entry.timestamp, Timestamp(1));
        assert_eq!(entry.volume, "vol1");
    }
}
