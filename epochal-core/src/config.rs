//! Layered configuration loading.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment -> explicit overrides. The concrete configuration types live
//! with the policies that consume them; this module only knows how to stack
//! the sources.

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ConfigError;

/// Environment prefix for configuration overrides.
pub const ENV_PREFIX: &str = "EPOCHAL_";

/// Load a configuration of type `T` from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `EPOCHAL_`, `__` separates nesting)
/// 3. The TOML file at `path`, when given and present
/// 4. `T::default()`
pub fn load_layered<T>(path: Option<&Path>, overrides: Option<&T>) -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::Load {
                message: format!("config file not found: {}", path.display()),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // EPOCHAL_EARLY_STOP__PATIENCE=3, EPOCHAL_CHECKPOINT__PERIOD_STEP=5, ...
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::Load {
        message: e.to_string(),
    })
}

/// Parse a configuration of type `T` from a TOML string, ignoring the environment.
pub fn from_toml_str<T>(source: &str) -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned + Default,
{
    Figment::from(Serialized::defaults(T::default()))
        .merge(Toml::string(source))
        .extract()
        .map_err(|e| ConfigError::Load {
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Sample {
        patience: u32,
        name: String,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                patience: 1,
                name: "default".into(),
            }
        }
    }

    #[test]
    fn test_defaults_when_no_sources() {
        let cfg: Sample = load_layered(None, None).unwrap();
        assert_eq!(cfg, Sample::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.toml");
        std::fs::write(&path, "patience = 4\n").unwrap();

        let cfg: Sample = load_layered(Some(&path), None).unwrap();
        assert_eq!(cfg.patience, 4);
        assert_eq!(cfg.name, "default");
    }

    #[test]
    fn test_explicit_overrides_win() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.toml");
        std::fs::write(&path, "patience = 4\n").unwrap();
        let overrides = Sample {
            patience: 9,
            name: "cli".into(),
        };

        let cfg: Sample = load_layered(Some(&path), Some(&overrides)).unwrap();
        assert_eq!(cfg, overrides);
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = load_layered::<Sample>(Some(Path::new("/nonexistent/epochal.toml")), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
    }

    #[test]
    fn test_from_toml_str() {
        let cfg: Sample = from_toml_str("name = \"inline\"").unwrap();
        assert_eq!(cfg.name, "inline");
        assert_eq!(cfg.patience, 1);
    }
}
