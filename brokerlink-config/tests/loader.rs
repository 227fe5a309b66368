use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use brokerlink_config::{
    ConfigGuardRailError, ConfigLoadError, ConfigLoader, ConfigSource, EnvConfig,
};
use brokerlink_core::ContentionPolicy;
use tempfile::TempDir;

fn env(vars: &[(&str, &str)]) -> EnvConfig {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    EnvConfig::from_lookup(|name| vars.get(name).cloned())
}

#[test]
fn falls_back_to_defaults_with_a_hint() -> Result<()> {
    let dir = TempDir::new()?;
    let load = ConfigLoader::new()
        .with_search_dir(dir.path())
        .load_with_env(env(&[]))?;

    assert_eq!(load.source, ConfigSource::Default);
    assert_eq!(load.config.orchestrator.retry.max_attempts, 3);
    assert_eq!(load.warnings.items.len(), 1);
    assert!(load.warnings.items[0].hint.is_some());
    Ok(())
}

#[test]
fn default_file_in_search_dir_is_picked_up() -> Result<()> {
    let dir = TempDir::new()?;
    fs::write(
        dir.path().join("brokerlink.toml"),
        "[orchestrator]\ncontention = \"reject\"\n",
    )?;

    let load = ConfigLoader::new()
        .with_search_dir(dir.path())
        .load_with_env(env(&[]))?;

    assert_eq!(load.source, ConfigSource::File(dir.path().join("brokerlink.toml")));
    assert_eq!(load.config.orchestrator.contention, ContentionPolicy::Reject);
    assert!(load.warnings.is_empty());
    Ok(())
}

#[test]
fn env_path_wins_over_inline_json_and_default_file() -> Result<()> {
    let dir = TempDir::new()?;
    fs::write(dir.path().join("brokerlink.toml"), "data_dir = \"from-default\"\n")?;
    let custom = dir.path().join("custom.json");
    fs::write(&custom, r#"{"data_dir": "from-env-path"}"#)?;
    let custom_str = custom.display().to_string();

    let load = ConfigLoader::new().with_search_dir(dir.path()).load_with_env(env(&[
        ("BROKERLINK_CONFIG_PATH", &custom_str),
        ("BROKERLINK_CONFIG_JSON", r#"{"data_dir": "from-inline"}"#),
    ]))?;

    assert_eq!(load.source, ConfigSource::EnvPath(custom));
    assert_eq!(load.config.data_dir, PathBuf::from("from-env-path"));
    Ok(())
}

#[test]
fn inline_json_beats_default_file() -> Result<()> {
    let dir = TempDir::new()?;
    fs::write(dir.path().join("brokerlink.toml"), "data_dir = \"from-default\"\n")?;

    let load = ConfigLoader::new().with_search_dir(dir.path()).load_with_env(env(&[(
        "BROKERLINK_CONFIG_JSON",
        r#"{"orchestrator": {"two_factor_max_attempts": 5}}"#,
    )]))?;

    assert_eq!(load.source, ConfigSource::EnvInline);
    assert_eq!(load.config.orchestrator.two_factor_max_attempts, 5);
    assert_eq!(load.config.data_dir, PathBuf::from("data"));
    Ok(())
}

#[test]
fn env_overrides_apply_on_top_of_the_file() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("brokerlink.toml");
    fs::write(&path, "data_dir = \"/srv/brokerlink\"\n")?;

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(env(&[
            ("BROKERLINK_DATA_DIR", "/tmp/override"),
            ("BROKERLINK_TWO_FACTOR_TIMEOUT", "10m"),
        ]))?;

    assert_eq!(load.source, ConfigSource::Explicit(path));
    assert_eq!(load.config.data_dir, PathBuf::from("/tmp/override"));
    assert_eq!(load.config.orchestrator.two_factor_timeout_ms, 600_000);
    Ok(())
}

#[test]
fn extensionless_files_accept_toml_or_json() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("brokerlinkrc");
    fs::write(&path, r#"{"master_secret_env": "MY_SECRET"}"#)?;

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(env(&[]))?;
    assert_eq!(load.config.master_secret_env, "MY_SECRET");
    Ok(())
}

#[test]
fn missing_explicit_file_is_an_error() {
    let err = ConfigLoader::new()
        .with_config_path("/definitely/not/here/brokerlink.toml")
        .load_with_env(env(&[]))
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn guard_rails_reject_unusable_policy() -> Result<()> {
    let dir = TempDir::new()?;
    let err = ConfigLoader::new()
        .with_search_dir(dir.path())
        .load_with_env(env(&[(
            "BROKERLINK_CONFIG_JSON",
            r#"{"orchestrator": {"retry": {"max_attempts": 0}}}"#,
        )]))
        .unwrap_err();

    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::ZeroRetryAttempts)
    ));
    Ok(())
}

#[test]
fn malformed_duration_override_names_the_variable() -> Result<()> {
    let dir = TempDir::new()?;
    let err = ConfigLoader::new()
        .with_search_dir(dir.path())
        .load_with_env(env(&[("BROKERLINK_TWO_FACTOR_TIMEOUT", "soon")]))
        .unwrap_err();

    assert!(err.to_string().contains("BROKERLINK_TWO_FACTOR_TIMEOUT"));
    Ok(())
}
