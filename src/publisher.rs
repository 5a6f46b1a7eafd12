use crate::error::{PersistError, StatusReadError};
use crate::types::Snapshot;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Writes each cycle's snapshot to the status record, replacing the previous one.
///
/// Readers only ever see a complete record: the snapshot is written to a
/// temporary file next to the record and renamed over it.
#[derive(Clone, Debug)]
pub struct StatusPublisher {
    path: PathBuf,
}

impl StatusPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn publish(&self, snapshot: &Snapshot) -> Result<(), PersistError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp_path = self.tmp_path();

        let result = write_then_rename(&tmp_path, &self.path, json.as_bytes());
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result.map_err(|source| PersistError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn tmp_path(&self) -> PathBuf {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "status".to_string());
        dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4()))
    }
}

fn write_then_rename(tmp_path: &Path, final_path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut f = File::create(tmp_path)?;
    f.write_all(contents)?;
    f.sync_all()?;
    fs::rename(tmp_path, final_path)
}

/// Read the status record as untyped JSON, exactly as published.
pub fn read_status(path: &Path) -> Result<Value, StatusReadError> {
    read_json(path)
}

/// Read the status record back into a [`Snapshot`].
pub fn read_snapshot(path: &Path) -> Result<Snapshot, StatusReadError> {
    read_json(path)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StatusReadError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StatusReadError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(StatusReadError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&raw).map_err(|source| StatusReadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
