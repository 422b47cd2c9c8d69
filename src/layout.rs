//! Disk layout helpers.
//!
//! Deterministic path derivation, atomic rename, directory creation,
//! object-name (de)composition, and a thin wrapper over `statfs(2)`. None
//! of these functions touch coordinator state; they are pure or
//! single-syscall primitives the coordinator and monitors call into.

use std::hash::Hasher;
use std::path::{Path, PathBuf};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use siphasher::sip::SipHasher13;

use crate::errors::NodeError;

/// Marker prefix for a tag write that has not yet been committed.
pub const PARTIAL_PREFIX: &str = "!partial.";

/// The two object kinds `hashdir` fans out into separate subtrees for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tag,
}

impl ObjectKind {
    fn dirname(self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
        }
    }
}

const PATH_CHARS: &AsciiSet = &CONTROLS.add(b'/').add(b'?').add(b'#').add(b' ');

/// Derive the on-disk path and the URL a listener would use to reach the
/// same object, for `name` under `volume` of kind `kind`.
///
/// The exact fan-out scheme is not load-bearing for cluster agreement:
/// other nodes never need to reproduce these bytes. We hash the name with
/// `siphasher` and take two bytes of the digest as two levels of hex
/// subdirectories, keeping any one volume subtree from holding an
/// unbounded number of entries in a single directory.
pub fn hashdir(
    name: &str,
    node_name: &str,
    kind: ObjectKind,
    root: &Path,
    volume: &str,
) -> (PathBuf, String) {
    let mut hasher = SipHasher13::new();
    hasher.write(name.as_bytes());
    let digest = hasher.finish();
    let bytes = digest.to_be_bytes();
    let d1 = format!("{:02x}", bytes[0]);
    let d2 = format!("{:02x}", bytes[1]);

    let local = root
        .join(volume)
        .join(kind.dirname())
        .join(&d1)
        .join(&d2)
        .join(name);

    let encoded_name = utf8_percent_encode(name, PATH_CHARS).to_string();
    let url = format!(
        "http://{}/{}/{}/{}/{}",
        node_name,
        kind.dirname(),
        d1,
        d2,
        encoded_name
    );

    (local, url)
}

/// Create all missing path components of `path`.
pub fn ensure_dir(path: &Path) -> Result<(), NodeError> {
    std::fs::create_dir_all(path).map_err(|err| NodeError::io("ensure_dir", path, err))
}

/// Atomically rename `src` to `dst` (both assumed to be on the same
/// volume, hence the same filesystem).
pub fn safe_rename(src: &Path, dst: &Path) -> Result<(), NodeError> {
    std::fs::rename(src, dst).map_err(|err| NodeError::io("rename", src, err))
}

/// Render `(tag_name, timestamp)` as the canonical on-disk object name.
pub fn pack_objname(tag_name: &str, timestamp: u64) -> String {
    format!("{}+{}", tag_name, timestamp)
}

/// Parse an on-disk object name back into `(tag_name, timestamp)`, splitting
/// on the last `+` (tag names themselves are not expected to contain `+`,
/// but splitting on the last occurrence keeps this robust either way).
pub fn unpack_objname(encoded: &str) -> Result<(String, u64), NodeError> {
    let (tag_name, ts) = encoded
        .rsplit_once('+')
        .ok_or_else(|| NodeError::internal(format!("malformed object name {:?}: missing '+'", encoded)))?;
    let timestamp: u64 = ts.parse().map_err(|_| {
        NodeError::internal(format!(
            "malformed object name {:?}: non-numeric timestamp",
            encoded
        ))
    })?;
    Ok((tag_name.to_string(), timestamp))
}

/// Prefix an object name with the partial-write marker.
pub fn partial_name(objname: &str) -> String {
    format!("{}{}", PARTIAL_PREFIX, objname)
}

/// True if `basename` is a partial (or otherwise marked) tag file that must
/// be excluded from the tag index.
pub fn is_partial(basename: &str) -> bool {
    basename.starts_with('!')
}

/// Free/used bytes as reported by `statfs(2)` for the filesystem backing
/// `path`.
pub fn diskspace(path: &Path) -> Result<(u64, u64), NodeError> {
    let mut stat: libc::statfs64 = unsafe { std::mem::zeroed() };

    use nix::NixPath;
    let to_io_error = |err: nix::Error| std::io::Error::new(std::io::ErrorKind::Other, err.to_string());

    let res = path
        .with_nix_path(|cstr| unsafe { libc::statfs64(cstr.as_ptr(), &mut stat) })
        .map_err(|err| NodeError::io("statfs", path, to_io_error(err)))?;
    nix::errno::Errno::result(res).map_err(|err| NodeError::io("statfs", path, to_io_error(err)))?;

    let bsize = stat.f_bsize as u64;
    let free = stat.f_bavail * bsize;
    let used = (stat.f_blocks - stat.f_bfree) * bsize;
    Ok((free, used))
}

/// Enumerate the direct filenames of `dir`, folding `f` over them. This is
/// the non-recursive primitive the tag index's recursive walk is built on.
pub fn fold_files<T>(
    dir: &Path,
    mut f: impl FnMut(&str, &Path, T) -> T,
    mut acc: T,
) -> Result<T, NodeError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(acc),
        Err(err) => return Err(NodeError::io("read_dir", dir, err)),
    };

    for entry in entries {
        let entry = entry.map_err(|err| NodeError::io("read_dir", dir, err))?;
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            acc = f(name, &path, acc);
        }
    }
    Ok(acc)
}

/// Recursively enumerate every regular file under `dir`, invoking `f` with
/// its basename and full path. The hash-directory layout nests tag/blob
/// files two levels deep, so the tag index's `build` needs this rather
/// than the single-level `fold_files`; each directory level's files are
/// still enumerated through `fold_files` itself, with the recursion into
/// subdirectories layered on top of it.
pub fn walk_files(dir: &Path, mut f: impl FnMut(&str, &Path)) -> Result<(), NodeError> {
    walk_files_rec(dir, &mut f)
}

fn walk_files_rec(dir: &Path, f: &mut dyn FnMut(&str, &Path)) -> Result<(), NodeError> {
    fold_files(dir, |name, path, ()| f(name, path), ())?;

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(NodeError::io("read_dir", dir, err)),
    };
    for entry in entries {
        let entry = entry.map_err(|err| NodeError::io("read_dir", dir, err))?;
        let path = entry.path();
        if path.is_dir() {
            walk_files_rec(&path, f)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashdir_is_deterministic() {
        let root = Path::new("/ddfs");
        let a = hashdir("blob1", "node0", ObjectKind::Blob, root, "vol0");
        let b = hashdir("blob1", "node0", ObjectKind::Blob, root, "vol0");
        assert_eq!(a, b);
        assert!(a.0.starts_with(root));
        assert!(a.0.ends_with("blob1"));
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let name = pack_objname("mytag", 100);
        assert_eq!(name, "mytag+100");
        let (tag, ts) = unpack_objname(&name).unwrap();
        assert_eq!(tag, "mytag");
        assert_eq!(ts, 100);
    }

    #[test]
    fn partial_marker() {
        let name = pack_objname("mytag", 100);
        let partial = partial_name(&name);
        assert_eq!(partial, "!partial.mytag+100");
        assert!(is_partial(&partial));
        assert!(!is_partial(&name));
    }
}
