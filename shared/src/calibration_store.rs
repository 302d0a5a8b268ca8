//! Named storage for calibration records.
//!
//! Each record is one pretty-printed JSON file `<root>/<name>.json`.
//! All records live in ~/.lsm_config/calibration/ by default.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error reading or writing a stored record
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid record name '{0}'")]
    InvalidName(String),
}

/// Directory of named calibration records
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    /// Root directory holding one JSON file per record
    root_path: PathBuf,
}

impl CalibrationStore {
    /// Create a store at the default path (~/.lsm_config/calibration)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        let root_path = PathBuf::from(home).join(".lsm_config").join("calibration");
        Ok(Self { root_path })
    }

    /// Create a store with a custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn record_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && !name.starts_with('.');
        if !valid {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.root_path.join(format!("{name}.json")))
    }

    /// Load the record called `name`.
    ///
    /// Returns None if no such record exists.
    /// Returns Some(Err) if the file exists but cannot be loaded.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Option<Result<T, StoreError>> {
        let path = match self.record_path(name) {
            Ok(path) => path,
            Err(e) => return Some(Err(e)),
        };

        if !path.exists() {
            return None;
        }

        Some(Self::read(&path))
    }

    fn read<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Save `record` under `name`, replacing any previous record.
    ///
    /// Creates the root directory if it doesn't exist.
    /// Returns the path where the record was saved.
    pub fn save<T: Serialize>(&self, name: &str, record: &T) -> Result<PathBuf, StoreError> {
        let path = self.record_path(name)?;
        std::fs::create_dir_all(&self.root_path)?;

        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, record)?;
        Ok(path)
    }

    /// Names of all stored records, sorted
    pub fn list(&self) -> std::io::Result<Vec<String>> {
        if !self.root_path.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root_path)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete the record called `name`.
    ///
    /// Returns Ok(true) if the file was deleted, Ok(false) if it didn't exist.
    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.record_path(name)?;

        if !path.exists() {
            return Ok(false);
        }

        std::fs::remove_file(path)?;
        Ok(true)
    }
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_path(PathBuf::from(".lsm_config/calibration")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        matrix: [f64; 4],
        coefficients: Vec<f64>,
    }

    fn awkward_record() -> Record {
        Record {
            matrix: [0.1 + 0.2, 1.0 / 3.0, -2.0f64.sqrt(), 1e-300],
            coefficients: vec![std::f64::consts::PI, 0.7 * 0.7, f64::MIN_POSITIVE],
        }
    }

    #[test]
    fn test_save_load_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::with_path(dir.path().join("calibration"));
        let record = awkward_record();

        let path = store.save("system", &record).unwrap();
        assert!(path.ends_with("system.json"));

        let loaded: Record = store.load("system").unwrap().unwrap();
        for (a, b) in loaded.matrix.iter().zip(record.matrix.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        for (a, b) in loaded.coefficients.iter().zip(record.coefficients.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::with_path(dir.path().to_path_buf());

        assert!(store.load::<Record>("nothing").is_none());
        assert!(!store.delete("nothing").unwrap());
    }

    #[test]
    fn test_corrupt_record_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::with_path(dir.path().to_path_buf());
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

        assert!(matches!(
            store.load::<Record>("broken"),
            Some(Err(StoreError::Json(_)))
        ));
    }

    #[test]
    fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::with_path(dir.path().to_path_buf());
        store.save("b", &awkward_record()).unwrap();
        store.save("a", &awkward_record()).unwrap();

        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(store.delete("a").unwrap());
        assert_eq!(store.list().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_rejects_path_like_names() {
        let store = CalibrationStore::with_path(PathBuf::from("/tmp/unused"));
        assert!(matches!(
            store.save("../escape", &awkward_record()),
            Err(StoreError::InvalidName(_))
        ));
    }
}
