use crate::models::PatcherConfig;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, Environment, File, FileFormat};
use std::fs;

/// Name of the settings file inside the working directory
pub const CONFIG_FILE: &str = "gamepatcher.yaml";

/// Prefix of environment variables that override the settings file
pub const ENV_PREFIX: &str = "GAMEPATCHER";

/// Loads and saves `gamepatcher.yaml`.
///
/// Settings are layered: built-in defaults, then the YAML file (if present), then
/// `GAMEPATCHER_*` environment variables. Nested keys use `__`, so
/// `GAMEPATCHER_TOOLS__XDELTA` sets `tools.xdelta`.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    config_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a ConfigManager for the settings file in `config_dir`.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Self {
        let config_dir = config_dir.as_ref().to_path_buf();
        Self {
            config_path: config_dir.join(CONFIG_FILE),
            config_dir,
        }
    }

    /// Load settings from the file and the process environment.
    ///
    /// # Returns
    /// The merged PatcherConfig; defaults if neither source sets anything
    pub fn load(&self) -> Result<PatcherConfig> {
        self.load_with_environment(None)
    }

    /// Load settings, reading overrides from `env` instead of the process environment
    /// when it is given.
    pub fn load_with_environment(
        &self,
        env: Option<config::Map<String, String>>,
    ) -> Result<PatcherConfig> {
        if self.config_path.exists() {
            tracing::info!("Loading config from {}", self.config_path);
        } else {
            tracing::debug!("Config file not found at {}, using defaults", self.config_path);
        }

        let settings = Config::builder()
            .add_source(File::new(self.config_path.as_str(), FileFormat::Yaml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .with_context(|| format!("Failed to read config: {}", self.config_path))?;

        settings
            .try_deserialize::<PatcherConfig>()
            .with_context(|| format!("Failed to parse config: {}", self.config_path))
    }

    /// Write `config` to the settings file.
    pub fn save(&self, config: &PatcherConfig) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(config).context("Failed to serialize config to YAML")?;

        fs::write(&self.config_path, yaml_string)
            .with_context(|| format!("Failed to write config: {}", self.config_path))?;

        tracing::info!("Saved config to {}", self.config_path);
        Ok(())
    }

    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PatchTarget;
    use tempfile::TempDir;

    fn create_test_config_manager() -> (ConfigManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let manager = ConfigManager::new(&config_path);
        (manager, temp_dir)
    }

    fn no_env() -> Option<config::Map<String, String>> {
        Some(config::Map::new())
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let (manager, _temp_dir) = create_test_config_manager();

        let config = manager.load_with_environment(no_env()).unwrap();
        assert_eq!(config.tool_timeout_secs, PatcherConfig::default().tool_timeout_secs);
        assert!(!config.tolerant);
    }

    #[test]
    fn test_save_and_load() {
        let (manager, _temp_dir) = create_test_config_manager();

        let mut config = PatcherConfig::default();
        config.tolerant = true;
        config.max_workers = 3;
        config
            .patch_names
            .insert(PatchTarget::Manual, "Guide.xdelta".to_string());
        manager.save(&config).unwrap();

        let loaded = manager.load_with_environment(no_env()).unwrap();
        assert!(loaded.tolerant);
        assert_eq!(loaded.max_workers, 3);
        assert_eq!(loaded.patch_name(PatchTarget::Manual), "Guide.xdelta");
    }

    #[test]
    fn test_environment_overrides_file() {
        let (manager, _temp_dir) = create_test_config_manager();
        fs::write(manager.config_path(), "tool_timeout_secs: 60\n").unwrap();

        let mut env = config::Map::new();
        env.insert("GAMEPATCHER_TOOL_TIMEOUT_SECS".to_string(), "90".to_string());
        env.insert(
            "GAMEPATCHER_TOOLS__MAKEROM".to_string(),
            "/opt/makerom".to_string(),
        );

        let loaded = manager.load_with_environment(Some(env)).unwrap();
        assert_eq!(loaded.tool_timeout_secs, 90);
        assert_eq!(loaded.tools.makerom, Utf8PathBuf::from("/opt/makerom"));
        assert_eq!(loaded.tools.xdelta, Utf8PathBuf::from("xdelta3"));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let (manager, _temp_dir) = create_test_config_manager();
        fs::write(manager.config_path(), "tolerant: [not, a, bool]\n").unwrap();

        assert!(manager.load_with_environment(no_env()).is_err());
    }
}
