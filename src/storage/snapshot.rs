//! Whole-state snapshots on disk.
//!
//! The in-memory engine keeps everything in memory and persists on commit by
//! replacing a single bincode-encoded snapshot file. A new snapshot is written
//! next to the old one and renamed over it, so a crash mid-write leaves the
//! previous commit intact.
use std::{
    fmt,
    fs::{self, File},
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
    decode_from_std_read, encode_into_std_write,
};
use log::{debug, info};

use super::SnapshotError;

#[derive(Clone)]
pub struct SnapshotFile {
    path: PathBuf,
    config: Configuration<LittleEndian, Fixint>,
}

impl fmt::Debug for SnapshotFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotFile")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let config = bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding();
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the last committed state, or `None` if nothing was ever committed.
    pub fn load<T: Decode<()>>(&self) -> Result<Option<T>, SnapshotError> {
        let f = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no snapshot at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(f);
        let state = decode_from_std_read(&mut reader, self.config)?;
        info!("loaded snapshot {}", self.path.display());
        Ok(Some(state))
    }

    pub fn store<T: Encode>(&self, state: &T) -> Result<(), SnapshotError> {
        let staging = self.path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            encode_into_std_write(state, &mut writer, self.config)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        debug!("snapshot written to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[derive(Debug, PartialEq, Encode, Decode)]
    struct State {
        next: u64,
        names: Vec<String>,
    }

    #[test]
    fn debug_shows_the_path() {
        let file = SnapshotFile::new("/var/lib/tabwire/state.db");
        let shown = format!("{file:?}");
        assert!(shown.contains("state.db"), "{shown}");
    }

    #[test]
    fn missing_snapshot_loads_nothing() {
        let temp = TempDir::new("snapshot").unwrap();
        let file = SnapshotFile::new(temp.path().join("state.db"));
        assert_eq!(file.load::<State>().unwrap(), None);
    }

    #[test]
    fn store_replaces_previous_state() {
        let temp = TempDir::new("snapshot").unwrap();
        let file = SnapshotFile::new(temp.path().join("state.db"));

        let first = State {
            next: 1,
            names: vec!["a".into()],
        };
        file.store(&first).unwrap();
        assert_eq!(file.load::<State>().unwrap(), Some(first));

        let second = State {
            next: 2,
            names: vec!["a".into(), "b".into()],
        };
        file.store(&second).unwrap();
        assert_eq!(file.load::<State>().unwrap(), Some(second));
        assert!(!temp.path().join("state.tmp").exists());
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let temp = TempDir::new("snapshot").unwrap();
        let path = temp.path().join("state.db");
        fs::write(&path, [0xFF]).unwrap();
        assert!(matches!(
            SnapshotFile::new(path).load::<State>(),
            Err(SnapshotError::Deserialize(_))
        ));
    }
}
