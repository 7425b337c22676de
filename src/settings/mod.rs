pub use crate::database::models::AppSettings;
use crate::database::DB;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const DATA_DIR_ENV: &str = "PORTKEEPER_DATA_DIR";
const LEGACY_SETTINGS_FILE: &str = "settings.json";

/// Where the database and any legacy settings file live.
pub fn app_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|dir| dir.join("portkeeper"))
        .context("No platform data directory; set PORTKEEPER_DATA_DIR")
}

pub struct SettingsManager {
    db: DB,
    settings: Mutex<AppSettings>,
}

impl SettingsManager {
    /// Loads settings from the database. On first launch a `settings.json`
    /// in `app_data_dir` is imported if present, otherwise defaults are stored.
    pub async fn load(db: DB, app_data_dir: &Path) -> Result<Self> {
        let settings = match db.load_settings().await? {
            Some(settings) => settings,
            None => {
                let settings = import_legacy(&app_data_dir.join(LEGACY_SETTINGS_FILE));
                db.save_settings(&settings).await?;
                settings
            }
        };
        debug!("Active settings: {:?}", settings);

        Ok(Self {
            db,
            settings: Mutex::new(settings),
        })
    }

    pub fn get_settings(&self) -> AppSettings {
        self.settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn save_settings(&self, new_settings: AppSettings) -> Result<()> {
        self.db.save_settings(&new_settings).await?;
        debug!("Settings saved to database successfully");
        *self
            .settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_settings;

        Ok(())
    }
}

fn import_legacy(json_path: &Path) -> AppSettings {
    if !json_path.exists() {
        return AppSettings::default();
    }
    match std::fs::read_to_string(json_path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(settings) => {
                info!("Imported settings from {}", json_path.display());
                settings
            }
            Err(e) => {
                warn!("Ignoring malformed {}: {}", json_path.display(), e);
                AppSettings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {}: {}", json_path.display(), e);
            AppSettings::default()
        }
    }
}
