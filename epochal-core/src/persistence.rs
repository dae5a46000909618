//! Shared persistence utilities: atomic file writes, JSON load/save.
//!
//! Every policy persists its state as small JSON files inside a directory
//! owned by the caller. Writes go through a `.tmp` sibling and a rename so a
//! crash never leaves a half-written state file behind.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{EpochalError, Result, StateError};

/// File holding a policy's scalar state.
pub const INTERNAL_STATE_FILE: &str = "internal_state.json";
/// Learning rates captured at the start of an epoch.
pub const INIT_LR_FILE: &str = "init_lr_dict.json";
/// Learning rates captured at the end of an epoch.
pub const FINAL_LR_FILE: &str = "final_lr_dict.json";
/// Per-step learning-rate trace of an epoch.
pub const STEP_LR_FILE: &str = "step_lr_arr_dict.json";

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON, writes to a `.tmp` sibling file,
/// then atomically renames to the target path.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Fail unless `dir` is an existing directory.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(StateError::MissingDirectory {
            path: dir.to_path_buf(),
        }
        .into());
    }
    Ok(())
}

/// Write `data` as `file_name` inside an existing state directory.
pub fn save_state_file<T: Serialize>(dir: &Path, file_name: &str, data: &T) -> Result<()> {
    ensure_dir(dir)?;
    atomic_write_json(&dir.join(file_name), data)?;
    Ok(())
}

/// Load `file_name` from a state directory; a missing or malformed file is an error.
pub fn load_state_file<T: DeserializeOwned>(dir: &Path, file_name: &str) -> Result<T> {
    let path = dir.join(file_name);
    if !path.exists() {
        return Err(StateError::MissingFile { path }.into());
    }
    let data = std::fs::read_to_string(&path)?;
    serde_json::from_str(&data).map_err(|e| {
        EpochalError::from(StateError::Malformed {
            path,
            message: e.to_string(),
        })
    })
}

/// Remove `dir` if present and create it empty.
pub fn recreate_dir(dir: &Path) -> Result<PathBuf> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir(dir)?;
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestState {
        curr_epoch: u32,
        flag: bool,
    }

    #[test]
    fn test_state_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let state = TestState {
            curr_epoch: 7,
            flag: true,
        };

        save_state_file(dir.path(), INTERNAL_STATE_FILE, &state).unwrap();
        let loaded: TestState = load_state_file(dir.path(), INTERNAL_STATE_FILE).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_save_requires_existing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent");

        let err = save_state_file(&missing, INTERNAL_STATE_FILE, &1u32).unwrap_err();
        assert!(matches!(
            err,
            EpochalError::State(StateError::MissingDirectory { .. })
        ));
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let err = load_state_file::<TestState>(dir.path(), INTERNAL_STATE_FILE).unwrap_err();
        assert!(matches!(err, EpochalError::State(StateError::MissingFile { .. })));
    }

    #[test]
    fn test_load_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(INTERNAL_STATE_FILE), r#"{"curr_epoch": 1}"#).unwrap();

        let err = load_state_file::<TestState>(dir.path(), INTERNAL_STATE_FILE).unwrap_err();
        assert!(matches!(err, EpochalError::State(StateError::Malformed { .. })));
    }

    #[test]
    fn test_atomic_write_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean.json");

        atomic_write_json(&path, &"test").unwrap();
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<TestState>> = load_json(Path::new("/nonexistent/file.json"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_recreate_dir_clears_contents() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sched_0");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("stale.json"), "{}").unwrap();

        recreate_dir(&sub).unwrap();
        assert!(sub.is_dir());
        assert!(!sub.join("stale.json").exists());
    }
}
