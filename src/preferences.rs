use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::geo::Position;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub location_updates_enabled: bool,
    pub push_notifications_enabled: bool,
    pub asked_for_push_permission: bool,
    /// Position the last accepted update was computed against.
    pub last_fetched_position: Option<Position>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesPatch {
    pub location_updates_enabled: Option<bool>,
    pub push_notifications_enabled: Option<bool>,
    pub asked_for_push_permission: Option<bool>,
}

impl Preferences {
    pub fn load(path: &Path) -> AppResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(preferences) => Ok(preferences),
                Err(err) => {
                    warn!(
                        target: "preferences",
                        error = ?err,
                        "failed to parse preferences file; regenerating defaults"
                    );
                    let defaults = Self::default();
                    defaults.persist(path)?;
                    Ok(defaults)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let defaults = Self::default();
                defaults.persist(path)?;
                Ok(defaults)
            }
            Err(err) => Err(AppError::Io(err)),
        }
    }

    pub fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    pub fn apply_patch(&mut self, patch: &PreferencesPatch) {
        if let Some(enabled) = patch.location_updates_enabled {
            self.location_updates_enabled = enabled;
        }
        if let Some(enabled) = patch.push_notifications_enabled {
            self.push_notifications_enabled = enabled;
            // Answering the prompt either way counts as having asked.
            self.asked_for_push_permission = true;
        }
        if let Some(asked) = patch.asked_for_push_permission {
            self.asked_for_push_permission = asked;
        }
    }
}

pub fn preferences_path(data_dir: &Path) -> PathBuf {
    data_dir.join("preferences.json")
}

/// Shared, optionally file-backed preferences.
#[derive(Clone)]
pub struct PreferenceStore {
    path: Option<PathBuf>,
    current: Arc<Mutex<Preferences>>,
}

impl PreferenceStore {
    pub fn open(path: PathBuf) -> AppResult<Self> {
        let current = Preferences::load(&path)?;
        Ok(Self {
            path: Some(path),
            current: Arc::new(Mutex::new(current)),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: Arc::new(Mutex::new(Preferences::default())),
        }
    }

    pub fn get(&self) -> Preferences {
        self.current.lock().clone()
    }

    pub fn update(&self, patch: &PreferencesPatch) -> AppResult<Preferences> {
        self.mutate(|preferences| preferences.apply_patch(patch))
    }

    pub fn last_fetched_position(&self) -> Option<Position> {
        self.current.lock().last_fetched_position
    }

    pub fn set_last_fetched_position(&self, position: Position) -> AppResult<()> {
        self.mutate(|preferences| preferences.last_fetched_position = Some(position))?;
        Ok(())
    }

    /// The in-memory value only changes once the file write succeeded.
    fn mutate(&self, change: impl FnOnce(&mut Preferences)) -> AppResult<Preferences> {
        let mut current = self.current.lock();
        let mut next = current.clone();
        change(&mut next);
        if let Some(path) = &self.path {
            next.persist(path)?;
        }
        *current = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_defaults_when_file_missing() {
        let dir = tempdir().unwrap();
        let path = preferences_path(dir.path());
        let preferences = Preferences::load(&path).unwrap();
        assert_eq!(preferences, Preferences::default());
        assert!(path.exists());
    }

    #[test]
    fn regenerates_defaults_on_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = preferences_path(dir.path());
        fs::write(&path, "{not json").unwrap();
        let preferences = Preferences::load(&path).unwrap();
        assert!(!preferences.location_updates_enabled);
        assert!(Preferences::load(&path).is_ok());
    }

    #[test]
    fn store_persists_patches_and_position() {
        let dir = tempdir().unwrap();
        let path = preferences_path(dir.path());
        let store = PreferenceStore::open(path.clone()).unwrap();
        store
            .update(&PreferencesPatch {
                location_updates_enabled: Some(true),
                push_notifications_enabled: Some(false),
                asked_for_push_permission: None,
            })
            .unwrap();
        store
            .set_last_fetched_position(Position::new(40.0, -73.0))
            .unwrap();

        let reloaded = Preferences::load(&path).unwrap();
        assert!(reloaded.location_updates_enabled);
        assert!(reloaded.asked_for_push_permission);
        assert_eq!(reloaded.last_fetched_position, Some(Position::new(40.0, -73.0)));
    }

    #[test]
    fn failed_write_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        let path = preferences_path(dir.path());
        let store = PreferenceStore::open(path.clone()).unwrap();
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(store
            .set_last_fetched_position(Position::new(10.0, 10.0))
            .is_err());
        assert!(store.last_fetched_position().is_none());

        fs::remove_dir(&path).unwrap();
        store
            .set_last_fetched_position(Position::new(10.0, 10.0))
            .unwrap();
        let reloaded = Preferences::load(&path).unwrap();
        assert_eq!(reloaded.last_fetched_position, Some(Position::new(10.0, 10.0)));
    }

    #[test]
    fn patch_deserializes_from_camel_case() {
        let patch: PreferencesPatch =
            serde_json::from_str(r#"{"locationUpdatesEnabled": true}"#).unwrap();
        assert_eq!(patch.location_updates_enabled, Some(true));
        assert!(patch.push_notifications_enabled.is_none());
    }
}
