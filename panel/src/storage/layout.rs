//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::PanelError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the panel data directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Relational store for port settings, notes and reservations
    pub fn database_file(&self) -> File {
        File::new(self.base_dir.join("panel.db"))
    }

    /// Runtime lifecycle event log
    pub fn events_file(&self) -> File {
        File::new(self.base_dir.join("runtime-events.log"))
    }

    /// Get the cache directory
    pub fn cache_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("cache"))
    }

    /// Local copies of templates fetched from the origin
    pub fn templates_cache_dir(&self) -> Dir {
        self.cache_dir().subdir("templates")
    }

    /// One working directory per deployed project
    pub fn projects_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("projects"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), PanelError> {
        Dir::new(&self.base_dir).create().await?;
        self.templates_cache_dir().create().await?;
        self.projects_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        let base_dir = std::env::var_os("DOCKPANEL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/dockpanel"));
        Self::new(base_dir)
    }
}
