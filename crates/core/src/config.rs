use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::generator::ObligeGenerator;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "WADQUEUE_DATA_DIR";
pub const ENV_CONFIG_PATH: &str = "CONFIG_PATH";
pub const ENV_FILE_ROOT: &str = "FILE_ROOT";
pub const ENV_OBLIGE_ROOT: &str = "OBLIGE_ROOT";
pub const ENV_PORT: &str = "PORT";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// One sub-directory per task lives here.
    pub file_root: PathBuf,
    /// Generator install directory, also passed as its home directory.
    pub oblige_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Defaults to `<oblige_root>/Oblige`.
    pub program: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            file_root: PathBuf::from("output"),
            oblige_root: PathBuf::from("oblige"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Apply `FILE_ROOT`, `OBLIGE_ROOT` and `PORT` from `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(file_root) = lookup(ENV_FILE_ROOT) {
            self.paths.file_root = PathBuf::from(file_root);
        }
        if let Some(oblige_root) = lookup(ENV_OBLIGE_ROOT) {
            self.paths.oblige_root = PathBuf::from(oblige_root);
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_PORT} value: {port}"))?;
        }
        Ok(())
    }

    pub fn generator(&self) -> ObligeGenerator {
        let mut generator = ObligeGenerator::from_root(self.paths.oblige_root.clone());
        if let Some(program) = &self.generator.program {
            generator.program = resolve_relative_to(&self.paths.oblige_root, program);
        }
        generator
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. WADQUEUE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Config file location: CLI override, then `CONFIG_PATH`, then the data dir.
pub fn resolve_config_path(cli_override: Option<&Path>, data_dir: &Path) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_path) = env::var_os(ENV_CONFIG_PATH) {
        return PathBuf::from(env_path);
    }

    config_path(data_dir)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes default config.toml only if file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Make sure the task root exists before the first reconciliation pass lists it.
pub fn initialize_file_root(file_root: &Path) -> Result<()> {
    fs::create_dir_all(file_root)
        .with_context(|| format!("failed to create task root: {}", file_root.display()))
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.file_root, PathBuf::from("output"));
        assert_eq!(cfg.paths.oblige_root, PathBuf::from("oblige"));
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.generator.program, None);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_sections() {
        let decoded: AppConfig =
            toml::from_str("[paths]\nfile_root = \"/srv/wads\"\n").expect("parse partial");
        assert_eq!(decoded.paths.file_root, PathBuf::from("/srv/wads"));
        assert_eq!(decoded.paths.oblige_root, PathBuf::from("oblige"));
        assert_eq!(decoded.server, ServerConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let loaded = AppConfig::load_from_path(&dir.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_reports_malformed_toml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server\nport = ").expect("write broken config");

        let err = AppConfig::load_from_path(&path).expect_err("broken toml");
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn env_overrides_replace_paths_and_port() {
        let vars: HashMap<&str, &str> = [
            (ENV_FILE_ROOT, "/var/lib/wads"),
            (ENV_OBLIGE_ROOT, "/opt/oblige"),
            (ENV_PORT, "9000"),
        ]
        .into();
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .expect("apply overrides");

        assert_eq!(cfg.paths.file_root, PathBuf::from("/var/lib/wads"));
        assert_eq!(cfg.paths.oblige_root, PathBuf::from("/opt/oblige"));
        assert_eq!(cfg.server.port, 9000);
    }

    #[test]
    fn env_override_rejects_bad_port() {
        let mut cfg = AppConfig::default();
        let err = cfg
            .apply_env_overrides(|key| (key == ENV_PORT).then(|| "eighty".to_string()))
            .expect_err("non-numeric port");
        assert!(err.to_string().contains("invalid PORT value"));
    }

    #[test]
    fn generator_defaults_to_binary_under_oblige_root() {
        let mut cfg = AppConfig::default();
        cfg.paths.oblige_root = PathBuf::from("/opt/oblige");
        assert_eq!(cfg.generator().program, PathBuf::from("/opt/oblige/Oblige"));

        cfg.generator.program = Some(PathBuf::from("bin/oblige-cli"));
        let generator = cfg.generator();
        assert_eq!(generator.program, PathBuf::from("/opt/oblige/bin/oblige-cli"));
        assert_eq!(generator.home_dir, PathBuf::from("/opt/oblige"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn resolve_config_path_prefers_cli() {
        let result = resolve_config_path(Some(Path::new("/etc/wadqueue.toml")), Path::new("/data"));
        assert_eq!(result, PathBuf::from("/etc/wadqueue.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempdir().expect("tempdir");
        let data = temp.path().join("data");
        initialize_data_dir(&data).expect("initialize data dir");

        assert!(data.exists());
        assert!(data.join("config.toml").exists());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempdir().expect("tempdir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
    }
}
