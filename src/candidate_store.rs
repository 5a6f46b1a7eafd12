use crate::error::ConfigError;
use crate::types::Candidate;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{info, warn};

/// Source of the candidate list: a JSON array of address strings on disk.
#[derive(Clone, Debug)]
pub struct CandidateStore {
    path: PathBuf,
}

impl CandidateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the candidate list in file order.
    ///
    /// A missing file is not an error: it is created holding `[]` and an empty
    /// list is returned. Anything other than an array of strings is.
    pub fn load(&self) -> Result<Vec<Candidate>, ConfigError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "Candidate list '{}' not found, creating an empty one",
                    self.path.display()
                );
                self.initialize()?;
                return Ok(vec![]);
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let candidates = self.parse(&raw)?;
        info!(
            "Loaded {} candidates from '{}'",
            candidates.len(),
            self.path.display()
        );
        Ok(candidates)
    }

    fn parse(&self, raw: &str) -> Result<Vec<Candidate>, ConfigError> {
        let value: Value = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let Value::Array(entries) = value else {
            return Err(ConfigError::NotArray {
                path: self.path.clone(),
            });
        };

        entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| match entry {
                Value::String(address) => Ok(Candidate::new(address)),
                _ => Err(ConfigError::InvalidEntry {
                    path: self.path.clone(),
                    index,
                }),
            })
            .collect()
    }

    fn initialize(&self) -> Result<(), ConfigError> {
        fs::write(&self.path, "[]\n").map_err(|source| ConfigError::Init {
            path: self.path.clone(),
            source,
        })
    }
}
