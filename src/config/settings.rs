use log::{ info, warn };
use std::path::PathBuf;
use tokio::fs;

use crate::history::StoreError;
use crate::models::settings::Settings;

/// The single settings document. Last writer wins.
pub struct SettingsStore {
    path: PathBuf,
    defaults: Settings,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>, defaults: Settings) -> Self {
        Self { path: path.into(), defaults }
    }

    /// Returns the stored settings, creating the file with defaults when it is absent.
    pub async fn get(&self) -> Result<Settings, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings at {}, writing defaults", self.path.display());
                self.write(&self.defaults).await?;
                return Ok(self.defaults.clone());
            }
            Err(e) => {
                return Err(e.into());
            }
        };

        match serde_json::from_slice::<Settings>(&bytes) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!("Settings file {} is malformed ({}), using defaults", self.path.display(), e);
                Ok(self.defaults.clone())
            }
        }
    }

    /// Full overwrite; the caller sends a complete object.
    pub async fn save(&self, settings: &Settings) -> Result<(), StoreError> {
        settings.validate()?;
        self.write(settings).await?;
        info!(
            "Settings saved: backend={}, endpoint={}, model={}",
            settings.backend,
            settings.api_endpoint,
            settings.model
        );
        Ok(())
    }

    async fn write(&self, settings: &Settings) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(settings)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
