// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use mediacore_core::CoreConfig;

/// Environment prefix; nested keys use `__`, e.g. `MEDIACORE_PLAYER__PLAYOUT__TICK_MS=10`.
pub const ENV_PREFIX: &str = "MEDIACORE_";

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: CoreConfig,
    pub file_missing: Option<String>,
}

/// Loads the core configuration from defaults, a TOML file, and environment variables.
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file exists but contains invalid TOML syntax
/// - Environment variables are set but contain invalid values
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(CoreConfig::default()));

    let mut file_missing = None;

    // Try to load the config file, but don't fail if it doesn't exist
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: CoreConfig =
        figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to TOML.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&CoreConfig::default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mediacore_core::{LogLevel, PerfProfile};
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let result = load("/nonexistent/mediactl.toml").unwrap();
        assert_eq!(result.file_missing.as_deref(), Some("/nonexistent/mediactl.toml"));
        assert_eq!(result.config.player, CoreConfig::default().player);
    }

    #[test]
    fn toml_overrides_nested_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[log]
console_level = "debug"

[player]
profile = "low-latency"

[player.playout]
stuck_timeout_ms = 2500
"#
        )
        .unwrap();

        let result = load(file.path().to_str().unwrap()).unwrap();
        assert!(result.file_missing.is_none());
        let config = result.config;
        assert_eq!(config.log.console_level, LogLevel::Debug);
        assert_eq!(config.player.profile, Some(PerfProfile::LowLatency));
        assert_eq!(config.player.playout.stuck_timeout_ms, 2500);
        assert_eq!(config.player.playout.sync_tolerance_ms, 20);
        config.validate().unwrap();
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = generate_default().unwrap();
        let parsed: CoreConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, CoreConfig::default());
    }
}
