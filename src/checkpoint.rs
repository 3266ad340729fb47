use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::cast::ResolvedCast;
use crate::error::{Error, Result};

const CHECKPOINT_FILE: &str = ".lemon3";

/// Per-author sync frontier plus every enclosure cast collected so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    #[serde(default)]
    pub last_hash: String,
    /// Newest first.
    #[serde(default)]
    pub casts: Vec<ResolvedCast>,
}

impl SyncCheckpoint {
    pub fn is_first_run(&self) -> bool {
        self.last_hash.is_empty()
    }
}

/// Stores checkpoints as `<root>/<handle>/.lemon3`, next to the downloaded files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding an author's downloads and checkpoint.
    pub fn author_dir(&self, handle: &str) -> Result<PathBuf> {
        let name = handle.trim_start_matches('@');
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(Error::local_state(
                "checkpoint",
                format!("invalid author handle {handle:?}"),
            ));
        }
        Ok(self.root.join(name))
    }

    pub fn path_for(&self, handle: &str) -> Result<PathBuf> {
        Ok(self.author_dir(handle)?.join(CHECKPOINT_FILE))
    }

    /// Missing file means a first run; anything unreadable is an error.
    pub fn load(&self, handle: &str) -> Result<SyncCheckpoint> {
        let path = self.path_for(handle)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(SyncCheckpoint::default())
            }
            Err(err) => {
                return Err(Error::local_state(
                    format!("checkpoint: read {}", path.display()),
                    err,
                ))
            }
        };
        serde_json::from_slice(&bytes).map_err(|err| {
            Error::local_state(format!("checkpoint: parse {}", path.display()), err)
        })
    }

    /// Replaces the whole record. Readers see either the old or the new file.
    pub fn save(&self, handle: &str, checkpoint: &SyncCheckpoint) -> Result<()> {
        let path = self.path_for(handle)?;
        let dir = path
            .parent()
            .ok_or_else(|| Error::local_state("checkpoint", "path has no parent"))?;
        fs::create_dir_all(dir).map_err(|err| {
            Error::local_state(format!("checkpoint: create {}", dir.display()), err)
        })?;
        write_atomically(dir, &path, checkpoint).map_err(|err| {
            Error::local_state(format!("checkpoint: write {}", path.display()), err)
        })?;
        debug!(
            path = %path.display(),
            last_hash = %checkpoint.last_hash,
            casts = checkpoint.casts.len(),
            "checkpoint saved"
        );
        Ok(())
    }
}

fn write_atomically(dir: &Path, path: &Path, checkpoint: &SyncCheckpoint) -> io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, checkpoint)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cast(hash: &str) -> ResolvedCast {
        ResolvedCast {
            author_id: 3,
            author_handle: "alice".into(),
            timestamp: 1_700_000_000,
            hash: hash.into(),
            enclosure_cid: "bafymeta".into(),
            ..ResolvedCast::default()
        }
    }

    #[test]
    fn missing_checkpoint_is_a_first_run() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = store.load("@alice").unwrap();
        assert!(checkpoint.is_first_run());
        assert!(checkpoint.casts.is_empty());
    }

    #[test]
    fn save_replaces_the_previous_record() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store
            .save(
                "@alice",
                &SyncCheckpoint {
                    last_hash: "0xaa".into(),
                    casts: vec![cast("0xaa"), cast("0x99")],
                },
            )
            .unwrap();
        let next = SyncCheckpoint {
            last_hash: "0xbb".into(),
            casts: vec![cast("0xbb")],
        };
        store.save("alice", &next).unwrap();

        assert_eq!(store.load("alice").unwrap(), next);
        assert!(dir.path().join("alice").join(".lemon3").exists());
        let leftovers = fs::read_dir(dir.path().join("alice")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn file_layout_uses_short_field_names() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store
            .save(
                "alice",
                &SyncCheckpoint {
                    last_hash: "0xaa".into(),
                    casts: vec![cast("0xaa")],
                },
            )
            .unwrap();
        let raw = fs::read_to_string(store.path_for("alice").unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["last_hash"], "0xaa");
        assert_eq!(value["casts"][0]["fid"], 3);
        assert_eq!(value["casts"][0]["cid"], "bafymeta");
    }

    #[test]
    fn corrupt_checkpoint_is_a_local_state_error() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.path_for("alice").unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(store.load("alice"), Err(Error::LocalState { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn handles_cannot_escape_the_root() {
        let store = CheckpointStore::new("/tmp/lemon3");
        for handle in ["", "@", "..", "a/b", "@../x"] {
            assert!(store.path_for(handle).is_err(), "{handle}");
        }
    }
}
