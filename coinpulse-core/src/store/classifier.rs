//! Classifier state persistence

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::info;

use super::{ClassifierStore, ClassifierStoreError};
use crate::anomaly::ClassifierState;

/// Trained state as a single JSON document. The file is written to a sibling
/// temp path and renamed into place.
pub struct FileClassifierStore {
    path: PathBuf,
}

impl FileClassifierStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ClassifierStore for FileClassifierStore {
    fn load(&self) -> Result<ClassifierState, ClassifierStoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Err(ClassifierStoreError::NotFound),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, state: &ClassifierState) -> Result<(), ClassifierStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec(state)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;

        info!(
            path = %self.path.display(),
            samples = state.training_samples,
            "saved classifier state"
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryClassifierStore {
    state: Mutex<Option<ClassifierState>>,
    saves: Mutex<usize>,
}

impl InMemoryClassifierStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ClassifierState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: Mutex::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_none()
    }
}

impl ClassifierStore for InMemoryClassifierStore {
    fn load(&self) -> Result<ClassifierState, ClassifierStoreError> {
        self.state
            .lock()
            .clone()
            .ok_or(ClassifierStoreError::NotFound)
    }

    fn save(&self, state: &ClassifierState) -> Result<(), ClassifierStoreError> {
        *self.state.lock() = Some(state.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}
