//! Configuration model.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use brokerlink_core::{KeyDerivationSettings, OrchestratorPolicy};
use serde::{Deserialize, Serialize};

/// Variable read for the master secret unless configured otherwise.
pub const DEFAULT_MASTER_SECRET_ENV: &str = "BROKERLINK_MASTER_SECRET";
/// Data directory relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// Nothing found; built-in defaults.
    #[default]
    Default,
    /// File given explicitly to the loader.
    Explicit(PathBuf),
    /// `$BROKERLINK_CONFIG_PATH`.
    EnvPath(PathBuf),
    /// `$BROKERLINK_CONFIG_JSON`.
    EnvInline,
    /// One of the default file locations.
    File(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("built-in defaults"),
            Self::Explicit(path) => write!(f, "{}", path.display()),
            Self::EnvPath(path) => write!(f, "{} (BROKERLINK_CONFIG_PATH)", path.display()),
            Self::EnvInline => f.write_str("BROKERLINK_CONFIG_JSON"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Top-level settings shared by the CLI and embedding applications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the file-backed key-value store (credentials, sessions and
    /// the key-derivation salt).
    pub data_dir: PathBuf,
    /// Name of the environment variable holding the operator master secret.
    /// The secret itself never appears in configuration files.
    pub master_secret_env: String,
    /// Retry, timeout and two-factor policy.
    pub orchestrator: OrchestratorPolicy,
    /// Argon2 cost parameters for the master key.
    pub key_derivation: KeyDerivationSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            master_secret_env: DEFAULT_MASTER_SECRET_ENV.to_string(),
            orchestrator: OrchestratorPolicy::default(),
            key_derivation: KeyDerivationSettings::default(),
        }
    }
}

impl Config {
    /// Root of the file-backed store.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Human-readable `key = value` lines for `config show`.
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        let policy = &self.orchestrator;
        let human = |d: Duration| humantime::format_duration(d).to_string();
        vec![
            ("data_dir", self.data_dir.display().to_string()),
            ("master_secret_env", self.master_secret_env.clone()),
            ("retry.max_attempts", policy.retry.max_attempts.to_string()),
            ("retry.backoff_base", human(policy.retry.backoff_base())),
            ("retry.backoff_max", human(policy.retry.backoff_max())),
            ("step_timeout", human(policy.step_timeout())),
            ("login_timeout", human(policy.login_timeout())),
            ("two_factor_timeout", human(policy.two_factor_timeout())),
            (
                "two_factor_max_attempts",
                policy.two_factor_max_attempts.to_string(),
            ),
            (
                "session_ttl",
                human(Duration::from_secs(policy.session_ttl_secs)),
            ),
            ("contention", format!("{:?}", policy.contention).to_lowercase()),
            ("headless", policy.headless.to_string()),
            (
                "key_derivation",
                format!(
                    "argon2id m={}KiB t={} p={}",
                    self.key_derivation.memory_kib,
                    self.key_derivation.iterations,
                    self.key_derivation.parallelism
                ),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokerlink_core::ContentionPolicy;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/brokerlink"

            [orchestrator]
            contention = "reject"
            two_factor_timeout_ms = 90000
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/brokerlink"));
        assert_eq!(config.master_secret_env, DEFAULT_MASTER_SECRET_ENV);
        assert_eq!(config.orchestrator.contention, ContentionPolicy::Reject);
        assert_eq!(config.orchestrator.two_factor_timeout_ms, 90_000);
        assert_eq!(config.orchestrator.retry.max_attempts, 3);
        assert_eq!(config.key_derivation, KeyDerivationSettings::default());
    }

    #[test]
    fn summary_renders_human_durations() {
        let summary = Config::default().summary();
        let lookup = |key: &str| {
            summary
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(lookup("two_factor_timeout"), "5m");
        assert_eq!(lookup("session_ttl"), "7days");
        assert_eq!(lookup("contention"), "block");
    }
}
