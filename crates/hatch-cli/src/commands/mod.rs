pub mod completions;
pub mod exec_virtual;
pub mod image_clean;
pub mod man_pages;
pub mod run;
pub mod runtimes;

use hatch_runtime::{CancellationToken, Config, ConfigError};
use std::path::Path;
use tracing::warn;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Explicit path, otherwise the default location. Without `HOME` the
/// built-in defaults apply.
pub fn load_config(path: Option<&Path>) -> Result<Config, String> {
    let loaded = match path {
        Some(p) => Config::load_from(p),
        None => Config::load_default(),
    };
    match loaded {
        Ok(config) => Ok(config),
        Err(ConfigError::NoHome) => {
            warn!("HOME not set, using default configuration");
            Ok(Config::default())
        }
        Err(e) => Err(e.to_string()),
    }
}

/// First Ctrl-C cancels the running execution, a second one exits.
pub fn install_cancel_handler(cancel: &CancellationToken) {
    let token = cancel.clone();
    let _ = ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(130);
        }
        token.cancel();
        eprintln!("\ncancellation requested, stopping current execution...");
    });
}

pub fn colorize_availability(available: bool) -> String {
    use console::Style;
    if available {
        Style::new().green().apply_to("available").to_string()
    } else {
        Style::new().red().apply_to("unavailable").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_string() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn invalid_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "unknown_key = 1\n").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.contains("config.toml"), "{err}");
    }
}
