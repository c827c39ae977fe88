use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use drover_core::DroverConfig;
use tracing::debug;

use crate::error::ConfigLoadError;

pub const CONFIG_PATH_VAR: &str = "DROVER_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "DROVER_CONFIG_JSON";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";
pub const REDIS_URL_VAR: &str = "REDIS_URL";

const DEFAULT_CANDIDATES: &[&str] = &[
    "drover.toml",
    "drover.json",
    "config/drover.toml",
    "config/drover.json",
];

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    /// Path given to the loader directly (e.g. a CLI flag).
    Explicit(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Environment values the loader consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty(env::var(CONFIG_PATH_VAR).ok()).map(PathBuf::from),
            config_json: non_empty(env::var(CONFIG_JSON_VAR).ok()),
            database_url: non_empty(env::var(DATABASE_URL_VAR).ok()),
            redis_url: non_empty(env::var(REDIS_URL_VAR).ok()),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Directory the default candidate files are looked up in.
    pub base_dir: Option<PathBuf>,
}

/// Result of a load: validated configuration plus connection settings.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: DroverConfig,
    pub source: ConfigSource,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_base_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.options.base_dir = Some(dir.into());
        self
    }

    /// Load the env file (or an optional `.env`), then resolve configuration
    /// from the process environment.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            // An explicitly named file must exist.
            Some(path) => dotenvy::from_path(path).map(|_| true)?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let mut load = self.load_with_env(EnvConfig::gather())?;
        load.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Resolve configuration from an explicit environment snapshot.
    ///
    /// Order: explicit path, `$DROVER_CONFIG_PATH`, `$DROVER_CONFIG_JSON`,
    /// the first default candidate file that exists, built-in defaults.
    pub fn load_with_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (config, source) = self.resolve(&env)?;
        config.validate()?;
        debug!(?source, "configuration resolved");

        Ok(ConfigLoad {
            config,
            source,
            database_url: env.database_url,
            redis_url: env.redis_url,
            env_file_loaded: false,
        })
    }

    fn resolve(
        &self,
        env: &EnvConfig,
    ) -> Result<(DroverConfig, ConfigSource), ConfigLoadError> {
        if let Some(path) = &self.options.config_path {
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::Explicit(path.clone())));
        }

        if let Some(path) = &env.config_path {
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::EnvPath(path.clone())));
        }

        if let Some(raw) = &env.config_json {
            let config = parse_json(raw)
                .context("failed to parse DROVER_CONFIG_JSON")
                .map_err(|source| ConfigLoadError::Parse {
                    origin: CONFIG_JSON_VAR.to_string(),
                    source,
                })?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((DroverConfig::default(), ConfigSource::Default))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        let base = self.options.base_dir.as_deref().unwrap_or(Path::new("."));
        DEFAULT_CANDIDATES
            .iter()
            .map(|candidate| base.join(candidate))
            .find(|path| path.exists())
    }
}

pub fn load_from_file(path: &Path) -> Result<DroverConfig, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::MissingConfig {
            path: path.to_path_buf(),
        });
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let origin = path.display().to_string();

    let parsed = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents),
        Some("toml") | Some("tml") => {
            toml::from_str(&contents).map_err(|err| anyhow!("invalid toml: {err}"))
        }
        _ => parse_from_str(&contents, &origin),
    };
    parsed.map_err(|source| ConfigLoadError::Parse { origin, source })
}

/// Try TOML first, then JSON.
pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<DroverConfig> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse drover config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<DroverConfig> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid drover config json: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffing_accepts_both_formats() {
        let toml = parse_from_str("[agent]\nmax_workers = 7\n", "inline").unwrap();
        assert_eq!(toml.agent.max_workers, 7);
        let json = parse_from_str(r#"{"agent": {"max_workers": 9}}"#, "inline").unwrap();
        assert_eq!(json.agent.max_workers, 9);
        let err = parse_from_str("max_workers = = 1", "inline").unwrap_err();
        assert!(err.to_string().contains("toml error"));
    }

    #[test]
    fn blank_env_values_are_ignored() {
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(Some("x".into())).as_deref(), Some("x"));
    }
}
