//! Guard rails applied to a parsed configuration.

use thiserror::Error;

use super::models::Config;

/// Settings the orchestrator cannot run with.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    /// No attempt would ever run.
    #[error("orchestrator.retry.max_attempts must be at least 1")]
    ZeroRetryAttempts,
    /// No code could ever be submitted.
    #[error("orchestrator.two_factor_max_attempts must be at least 1")]
    ZeroTwoFactorAttempts,
    /// Backoff base above its cap.
    #[error(
        "orchestrator.retry.backoff_base_ms ({base}) exceeds backoff_max_ms ({max})"
    )]
    InvertedBackoff {
        /// Configured base, in milliseconds.
        base: u64,
        /// Configured cap, in milliseconds.
        max: u64,
    },
    /// A timeout of zero.
    #[error("orchestrator.{field} must be greater than zero")]
    ZeroTimeout {
        /// Policy field holding the zero.
        field: &'static str,
    },
    /// Blank master secret variable name.
    #[error("master_secret_env must name an environment variable")]
    EmptyMasterSecretEnv,
}

/// Non-fatal configuration finding.
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    /// What was noticed.
    pub message: String,
    /// How to address it.
    pub hint: Option<String>,
}

/// Warnings collected during a load.
#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    /// In the order they were raised.
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    /// Record a warning without a hint.
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    /// Record a warning with a hint.
    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    /// Nothing recorded.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append `other`.
    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Reject settings the orchestrator cannot run with and warn about questionable ones.
pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let policy = &config.orchestrator;

    if config.master_secret_env.trim().is_empty() {
        return Err(ConfigGuardRailError::EmptyMasterSecretEnv);
    }
    if policy.retry.max_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroRetryAttempts);
    }
    if policy.two_factor_max_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroTwoFactorAttempts);
    }
    if policy.retry.backoff_base_ms > policy.retry.backoff_max_ms {
        return Err(ConfigGuardRailError::InvertedBackoff {
            base: policy.retry.backoff_base_ms,
            max: policy.retry.backoff_max_ms,
        });
    }
    for (field, value) in [
        ("step_timeout_ms", policy.step_timeout_ms),
        ("login_timeout_ms", policy.login_timeout_ms),
        ("two_factor_timeout_ms", policy.two_factor_timeout_ms),
    ] {
        if value == 0 {
            return Err(ConfigGuardRailError::ZeroTimeout { field });
        }
    }

    if policy.login_timeout_ms < policy.step_timeout_ms {
        warnings.push_with_hint(
            "login_timeout_ms is shorter than a single browser step",
            "Raise orchestrator.login_timeout_ms above step_timeout_ms",
        );
    }
    if policy.two_factor_timeout_ms < 60_000 {
        warnings.push(
            "two_factor_timeout_ms is under a minute; SMS codes may arrive after the deadline",
        );
    }
    if policy.session_ttl_secs == 0 {
        warnings.push_with_hint(
            "session_ttl_secs is 0; every stored session is treated as expired",
            "Use a TTL of at least a few hours so sessions are reused",
        );
    }
    if !policy.headless {
        warnings.push("browser runs headed; unattended runs need a display");
    }
    if config.key_derivation.memory_kib < 19 * 1024 {
        warnings.push_with_hint(
            "key_derivation.memory_kib is below 19 MiB",
            "Weak Argon2 parameters make an offline guess of the master secret cheaper",
        );
    }

    Ok(warnings)
}
