//! Long-term storage for finished recordings

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::StorageSettings;
use crate::errors::RecorderError;

/// Descriptive metadata handed over with a finished container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub display_name: String,
    pub title: String,
    pub description: String,
    pub mime_type: String,
    /// Logical category, used as a relative folder by [`LibraryStore`]
    pub category: String,
}

impl MediaMetadata {
    /// Metadata for a recording from the device identified by `prefix`-`tag`
    pub fn for_recording(display_name: &str, storage: &StorageSettings, device_tag: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            title: storage.title.clone(),
            description: format!(
                "Thermal camera recording from {}-{}",
                storage.file_prefix, device_tag
            ),
            mime_type: "video/mp4".to_string(),
            category: storage.relative_path.clone(),
        }
    }
}

/// Copies or moves a finished container somewhere permanent
pub trait MediaStore: Send + Sync {
    /// Take ownership of `file` and return where it ended up
    fn persist(&self, file: &Path, metadata: &MediaMetadata) -> Result<PathBuf, RecorderError>;
}

/// Moves recordings into `library_dir/<category>/<display_name>`
pub struct LibraryStore {
    library_dir: PathBuf,
}

impl LibraryStore {
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: library_dir.into(),
        }
    }

    pub fn from_settings(storage: &StorageSettings) -> Self {
        Self::new(storage.library_dir.clone())
    }

    pub fn library_dir(&self) -> &Path {
        &self.library_dir
    }
}

impl MediaStore for LibraryStore {
    fn persist(&self, file: &Path, metadata: &MediaMetadata) -> Result<PathBuf, RecorderError> {
        let dir = self.library_dir.join(&metadata.category);
        fs::create_dir_all(&dir).map_err(|e| {
            RecorderError::Persistence(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let target = dir.join(&metadata.display_name);
        if fs::rename(file, &target).is_err() {
            // Different filesystem: copy, then remove the original
            fs::copy(file, &target).map_err(|e| {
                RecorderError::Persistence(format!(
                    "Failed to copy {} to {}: {}",
                    file.display(),
                    target.display(),
                    e
                ))
            })?;
            if let Err(e) = fs::remove_file(file) {
                log::warn!("Copied recording but could not remove {}: {}", file.display(), e);
            }
        }

        log::info!("Saved recording to {}", target.display());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_for_recording() {
        let storage = StorageSettings::default();
        let meta = MediaMetadata::for_recording("MINI2-256_261015_101500.mp4", &storage, "256");
        assert_eq!(meta.title, "MINI2 Thermal Recording");
        assert_eq!(meta.description, "Thermal camera recording from MINI2-256");
        assert_eq!(meta.mime_type, "video/mp4");
        assert_eq!(meta.category, "Movies/ThermalCamera");
    }

    #[test]
    fn test_library_store_moves_file() {
        let work = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        let source = work.path().join("clip.mp4");
        fs::write(&source, b"data").unwrap();

        let store = LibraryStore::new(library.path());
        let meta = MediaMetadata::for_recording("clip.mp4", &StorageSettings::default(), "384");
        let saved = store.persist(&source, &meta).unwrap();

        assert_eq!(
            saved,
            library.path().join("Movies/ThermalCamera").join("clip.mp4")
        );
        assert!(!source.exists());
        assert_eq!(fs::read(&saved).unwrap(), b"data");
    }

    #[test]
    fn test_missing_source_fails() {
        let library = tempfile::tempdir().unwrap();
        let store = LibraryStore::new(library.path());
        let meta = MediaMetadata::for_recording("x.mp4", &StorageSettings::default(), "256");
        let result = store.persist(Path::new("/definitely/not/here.mp4"), &meta);
        assert!(matches!(result, Err(RecorderError::Persistence(_))));
    }
}
