use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use std::path::{Path, PathBuf};

use super::{CatalogConfig, EngineConfig};
use crate::rules::catalog::RuleSpec;

// Embed the default config at compile time
const DEFAULT_CONFIG: &str = include_str!("../../default-config.toml");

const EXTENSIONS: [&str; 4] = ["toml", "json", "yaml", "yml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    Json,
    Toml,
}

/// Layered configuration: embedded defaults < user < repository < `--config`
/// < `RULEGUARD_*` environment variables
#[derive(Debug, Clone)]
pub struct RuleguardConfig {
    figment: Figment,
}

impl RuleguardConfig {
    /// Load configuration for the repository at `root`
    pub fn load(root: &Path, custom_config: Option<&Path>) -> Result<Self> {
        tracing::trace!("CONFIG LOAD: Starting for {}", root.display());

        let mut figment = Figment::new().merge(Toml::string(DEFAULT_CONFIG));
        if let Some(base) = Self::user_config_base_path() {
            figment = Self::merge_any_format(figment, &base);
        }
        figment = Self::merge_any_format(figment, &root.join("ruleguard"));

        if let Some(path) = custom_config {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => figment.merge(Json::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }

        let figment = figment.merge(Env::prefixed("RULEGUARD_").split("__"));
        Ok(Self { figment })
    }

    /// Only the embedded defaults
    pub fn defaults() -> Self {
        Self {
            figment: Figment::new().merge(Toml::string(DEFAULT_CONFIG)),
        }
    }

    /// Build from an in-memory TOML document layered over the defaults
    pub fn from_toml(document: &str) -> Self {
        Self {
            figment: Figment::new()
                .merge(Toml::string(DEFAULT_CONFIG))
                .merge(Toml::string(document)),
        }
    }

    fn merge_any_format(figment: Figment, base: &Path) -> Figment {
        let mut figment = figment;
        for ext in EXTENSIONS {
            let path = base.with_extension(ext);
            if !path.is_file() {
                continue;
            }
            tracing::debug!("Loading config from {}", path.display());
            figment = match ext {
                "toml" => figment.merge(Toml::file(&path)),
                "json" => figment.merge(Json::file(&path)),
                _ => figment.merge(Yaml::file(&path)),
            };
        }
        figment
    }

    fn user_config_base_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/ruleguard/config"))
    }

    pub fn engine(&self) -> Result<EngineConfig> {
        self.section("engine")
    }

    pub fn catalog(&self) -> Result<CatalogConfig> {
        self.section("catalog")
    }

    /// Declared rules, in declaration order
    pub fn rules(&self) -> Result<Vec<RuleSpec>> {
        if !self.figment.contains("rules") {
            return Ok(Vec::new());
        }
        self.figment
            .extract_inner("rules")
            .context("Invalid [[rules]] declaration")
    }

    fn section<T: serde::de::DeserializeOwned + Default>(&self, path: &str) -> Result<T> {
        if !self.figment.contains(path) {
            return Ok(T::default());
        }
        self.figment
            .extract_inner(path)
            .with_context(|| format!("Invalid [{path}] configuration"))
    }

    /// Get a nested object/section as JSON
    pub fn get_section(&self, path: &str) -> Result<serde_json::Value> {
        Ok(self.figment.extract_inner(path)?)
    }

    /// Get the full merged configuration as a structured value
    pub fn get_full_config(&self) -> Result<serde_json::Value> {
        Ok(self.figment.extract()?)
    }

    pub fn export(&self, format: ConfigFormat) -> Result<String> {
        let config = self.get_full_config()?;
        let output = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(&config)?,
            ConfigFormat::Toml => toml::to_string_pretty(&config)?,
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Isolation;
    use crate::rules::Severity;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_config_loads_defaults() {
        let config = RuleguardConfig::defaults();
        let engine = config.engine().unwrap();
        assert_eq!(engine.execution.timeout_secs, 60);
        assert_eq!(engine.profile.default_estimate_ms, 10);
        assert_eq!(engine.state_dir, PathBuf::from(".ruleguard"));
        assert!(!config.rules().unwrap().is_empty());
        assert!(!config.catalog().unwrap().default_reads.is_empty());
    }

    #[test]
    fn test_repo_config_overrides_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(
            temp_dir.path().join("ruleguard.toml"),
            "[engine]\nmax_workers = 3\nfail_on = \"critical\"\n[engine.execution]\nisolation = \"process\"\n",
        )?;

        let config = RuleguardConfig::load(temp_dir.path(), None)?;
        let engine = config.engine()?;
        assert_eq!(engine.max_workers, 3);
        assert_eq!(engine.fail_on, Severity::Critical);
        assert_eq!(engine.execution.isolation, Isolation::Process);
        // Untouched keys keep their defaults
        assert_eq!(engine.execution.timeout_secs, 60);
        Ok(())
    }

    #[test]
    fn test_custom_config_json() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("custom.json");
        fs::write(&path, r#"{"engine": {"cache": {"ttl_secs": 5}}}"#)?;

        let config = RuleguardConfig::load(temp_dir.path(), Some(&path))?;
        assert_eq!(config.engine()?.cache.ttl_secs, 5);
        Ok(())
    }

    #[test]
    fn test_missing_custom_config_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope.toml");
        assert!(RuleguardConfig::load(temp_dir.path(), Some(&missing)).is_err());
    }

    #[test]
    fn test_environment_overrides() -> Result<()> {
        let temp_dir = TempDir::new()?;
        unsafe {
            std::env::set_var("RULEGUARD_CATALOG__TEST_MARKER", "from-env");
        }
        let config = RuleguardConfig::load(temp_dir.path(), None)?;
        let catalog = config.get_section("catalog")?;
        assert_eq!(catalog["test_marker"], "from-env");
        Ok(())
    }

    #[test]
    fn test_export_formats() {
        let config = RuleguardConfig::defaults();
        assert!(config.export(ConfigFormat::Json).unwrap().contains("\"engine\""));
        assert!(config.export(ConfigFormat::Toml).unwrap().contains("[engine]"));
    }
}
