use std::{
    fs::{self, DirBuilder},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use utils::err;

const SETTINGS_FILE: &str = "settings.yaml";

#[derive(PartialEq, Serialize, Deserialize, Debug, Clone)]
pub struct SettingsYaml {
    /// Directories scanned for installed packages, highest priority first.
    #[serde(default = "default_package_roots")]
    pub package_roots: Vec<String>,
    #[serde(default = "default_package_extension")]
    pub package_extension: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    /// Empty means offline-only.
    #[serde(default)]
    pub catalog_url: String,
    #[serde(default = "default_catalog_passphrase")]
    pub catalog_passphrase: String,
    #[serde(default = "default_catalog_cache_path")]
    pub catalog_cache_path: String,
    #[serde(default = "default_allow_network")]
    pub allow_network: bool,
    #[serde(default = "default_parallel_downloads")]
    pub parallel_downloads: usize,
    #[serde(default = "default_catalog_retry_attempts")]
    pub catalog_retry_attempts: u32,
    #[serde(default = "default_catalog_retry_backoff_ms")]
    pub catalog_retry_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_progress_step_bytes")]
    pub progress_step_bytes: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_package_roots() -> Vec<String> {
    vec![String::from("AddonPackages")]
}

fn default_package_extension() -> String {
    "var".to_string()
}

fn default_download_dir() -> String {
    "AddonPackages".to_string()
}

fn default_catalog_passphrase() -> String {
    "varsync-catalog".to_string()
}

fn default_catalog_cache_path() -> String {
    utils::get_cache_dir()
        .map(|dir| dir.join("catalog.json"))
        .unwrap_or_else(|_| PathBuf::from("catalog.json"))
        .to_string_lossy()
        .into_owned()
}

fn default_allow_network() -> bool {
    true
}

fn default_parallel_downloads() -> usize {
    3
}

fn default_catalog_retry_attempts() -> u32 {
    5
}

fn default_catalog_retry_backoff_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_progress_step_bytes() -> u64 {
    256 * 1024
}

fn default_log_dir() -> String {
    utils::get_log_dir()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("logs"))
}

impl Default for SettingsYaml {
    fn default() -> Self {
        SettingsYaml {
            package_roots: default_package_roots(),
            package_extension: default_package_extension(),
            download_dir: default_download_dir(),
            catalog_url: String::new(),
            catalog_passphrase: default_catalog_passphrase(),
            catalog_cache_path: default_catalog_cache_path(),
            allow_network: default_allow_network(),
            parallel_downloads: default_parallel_downloads(),
            catalog_retry_attempts: default_catalog_retry_attempts(),
            catalog_retry_backoff_ms: default_catalog_retry_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            progress_step_bytes: default_progress_step_bytes(),
            log_dir: default_log_dir(),
        }
    }
}

impl SettingsYaml {
    pub fn package_roots(&self) -> Vec<PathBuf> {
        self.package_roots.iter().map(PathBuf::from).collect()
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    Ok(utils::get_dir()?.join(SETTINGS_FILE))
}

pub fn get_settings() -> Result<SettingsYaml, String> {
    let path = settings_path()?;
    if !path.exists() {
        // First run: persist the defaults so users have a file to edit
        let settings = SettingsYaml::default();
        let _ = save_to(&path, &settings);
        return Ok(settings);
    }
    load_from(&path)
}

pub fn set_settings(settings: &SettingsYaml) -> Result<(), String> {
    save_to(&settings_path()?, settings)
}

pub fn load_from(path: &Path) -> Result<SettingsYaml, String> {
    if !path.is_file() {
        return err!("Settings file `{}` is of unexpected type!", path.display());
    }
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return err!("Failed to read settings file `{}`!", path.display()),
    };
    match serde_norway::from_str(&contents) {
        Ok(settings) => Ok(settings),
        Err(e) => err!("Failed to parse settings file `{}`: {e}", path.display()),
    }
}

pub fn save_to(path: &Path, settings: &SettingsYaml) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
        && DirBuilder::new().recursive(true).create(parent).is_err()
    {
        return err!("Failed to create settings directory!");
    }
    let settings = match serde_norway::to_string(settings) {
        Ok(settings) => settings,
        Err(_) => return err!("Failed to parse SettingsYaml to string!"),
    };
    match fs::write(path, settings.as_bytes()) {
        Ok(_) => Ok(()),
        Err(_) => err!("Failed to write to file!"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings: SettingsYaml =
            serde_norway::from_str("catalog_url: https://example.invalid/db\n").unwrap();
        assert_eq!(settings.catalog_url, "https://example.invalid/db");
        assert_eq!(settings.parallel_downloads, 3);
        assert_eq!(settings.package_extension, "var");
        assert_eq!(settings.catalog_retry_attempts, 5);
        assert!(settings.allow_network);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(SETTINGS_FILE);
        let mut settings = SettingsYaml::default();
        settings.package_roots = vec![String::from("/games/vam/AddonPackages")];
        settings.parallel_downloads = 5;

        save_to(&path, &settings).unwrap();
        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(load_from(&temp_dir.path().join(SETTINGS_FILE)).is_err());
    }
}
