//! Configuration discovery: explicit path, environment, default files, then defaults.

mod error;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

pub use error::ConfigLoadError;

use crate::models::{Config, ConfigSource};
use crate::validation::{self, ConfigWarnings};

/// Path to a TOML or JSON config file.
pub const CONFIG_PATH_ENV: &str = "BROKERLINK_CONFIG_PATH";
/// Inline JSON configuration.
pub const CONFIG_JSON_ENV: &str = "BROKERLINK_CONFIG_JSON";
/// Overrides `data_dir`.
pub const DATA_DIR_ENV: &str = "BROKERLINK_DATA_DIR";
/// Overrides the two-factor wait, in seconds.
pub const TWO_FACTOR_TIMEOUT_ENV: &str = "BROKERLINK_TWO_FACTOR_TIMEOUT";

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &[
    "brokerlink.toml",
    "brokerlink.json",
    "config/brokerlink.toml",
];

/// Environment inputs the loader looks at.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    /// `$BROKERLINK_CONFIG_PATH`.
    pub config_path: Option<PathBuf>,
    /// `$BROKERLINK_CONFIG_JSON`.
    pub config_json: Option<String>,
    /// `$BROKERLINK_DATA_DIR`.
    pub data_dir: Option<PathBuf>,
    /// `$BROKERLINK_TWO_FACTOR_TIMEOUT`, unparsed.
    pub two_factor_timeout: Option<String>,
}

impl EnvConfig {
    /// Read the process environment.
    pub fn gather() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Self {
            config_path: var(CONFIG_PATH_ENV).map(PathBuf::from),
            config_json: var(CONFIG_JSON_ENV),
            data_dir: var(DATA_DIR_ENV).map(PathBuf::from),
            two_factor_timeout: var(TWO_FACTOR_TIMEOUT_ENV),
        }
    }
}

/// Knobs for [`ConfigLoader`].
#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    /// Explicit config file; wins over every other source.
    pub config_path: Option<PathBuf>,
    /// `.env` file to load instead of the one in the working directory.
    pub env_file: Option<PathBuf>,
    /// Directory searched for the default config files. Defaults to the
    /// working directory.
    pub search_dir: Option<PathBuf>,
}

/// Result of a successful load.
#[derive(Debug)]
pub struct ConfigLoad {
    /// Effective configuration.
    pub config: Config,
    /// Where it came from.
    pub source: ConfigSource,
    /// Non-fatal findings to show the operator.
    pub warnings: ConfigWarnings,
}

/// Resolves a [`Config`] from files and the environment.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    /// Loader with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader with the given options.
    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    /// Use `path` as the config file.
    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    /// Load `path` as the `.env` file.
    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Look for the default config files under `dir`.
    pub fn with_search_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.options.search_dir = Some(dir.into());
        self
    }

    /// Load `.env`, then resolve configuration from the process environment.
    ///
    /// Evaluation order:
    /// 1) an explicit path given to the loader,
    /// 2) `$BROKERLINK_CONFIG_PATH` (TOML or JSON file),
    /// 3) `$BROKERLINK_CONFIG_JSON` (inline JSON),
    /// 4) `brokerlink.toml` and friends in the search directory,
    /// 5) defaults.
    ///
    /// `$BROKERLINK_DATA_DIR` and `$BROKERLINK_TWO_FACTOR_TIMEOUT` override
    /// whatever the source provided.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };
        debug!(env_file_loaded, "environment gathered");

        self.load_with_env(EnvConfig::gather())
    }

    /// Same as [`ConfigLoader::load`] against a prepared environment.
    pub fn load_with_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();
        let (mut config, source) = self.resolve(&env)?;

        if source == ConfigSource::Default {
            warnings.push_with_hint(
                "No brokerlink.toml detected; using built-in defaults",
                format!("Set {CONFIG_PATH_ENV} or create brokerlink.toml to tune the orchestrator"),
            );
        }

        if let Some(dir) = env.data_dir {
            config.data_dir = dir;
        }
        if let Some(raw) = env.two_factor_timeout {
            let timeout = humantime::parse_duration(&raw).map_err(|err| {
                ConfigLoadError::InvalidEnv {
                    var: TWO_FACTOR_TIMEOUT_ENV,
                    reason: err.to_string(),
                }
            })?;
            config.orchestrator.two_factor_timeout_ms =
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        }

        warnings.extend(validation::apply_guard_rails(&config)?);
        debug!(source = %source, data_dir = %config.data_dir.display(), "configuration resolved");

        Ok(ConfigLoad {
            config,
            source,
            warnings,
        })
    }

    fn resolve(&self, env: &EnvConfig) -> Result<(Config, ConfigSource), ConfigLoadError> {
        if let Some(path) = &self.options.config_path {
            if !path.exists() {
                return Err(ConfigLoadError::MissingConfig { path: path.clone() });
            }
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::Explicit(path.clone())));
        }

        if let Some(path) = &env.config_path {
            if !path.exists() {
                return Err(ConfigLoadError::MissingConfig { path: path.clone() });
            }
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::EnvPath(path.clone())));
        }

        if let Some(raw) = &env.config_json {
            let config = parse_json(raw, CONFIG_JSON_ENV)?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Config::default(), ConfigSource::Default))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        let root = self
            .options
            .search_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.exists())
    }
}

/// Parse a config file, picking the format from its extension.
pub fn load_from_file(path: &Path) -> Result<Config, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let origin = path.display().to_string();

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents, &origin),
        Some("toml") => toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
            origin,
            reason: err.to_string(),
        }),
        _ => parse_from_str(&contents, &origin),
    }
}

/// Try TOML first, then JSON.
pub fn parse_from_str(contents: &str, origin: &str) -> Result<Config, ConfigLoadError> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| ConfigLoadError::Parse {
            origin: origin.to_string(),
            reason: format!("toml error: {toml_err}; json error: {json_err}"),
        })
    })
}

/// Parse inline JSON configuration.
pub fn parse_json(raw: &str, origin: &str) -> Result<Config, ConfigLoadError> {
    serde_json::from_str(raw).map_err(|err| ConfigLoadError::Parse {
        origin: origin.to_string(),
        reason: err.to_string(),
    })
}
