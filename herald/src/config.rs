//! Locating and loading `herald.config.ron`

use std::path::{Path, PathBuf};

use herald_dispatch::{DispatchConfig, DispatchError};
use herald_metrics::MetricsConfig;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "HERALD_CONFIG";

/// Searched in order when neither `--config` nor [`CONFIG_ENV`] is given
pub const DEFAULT_PATHS: [&str; 2] = ["./herald.config.ron", "/etc/herald/herald.config.ron"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{source_name} points to non-existent file: {}", path.display())]
    Missing { source_name: &'static str, path: PathBuf },

    #[error("No configuration file found. Tried:\n{tried}")]
    NotFound { tried: String },

    #[error("Failed to read config from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error(transparent)]
    Invalid(#[from] DispatchError),
}

/// Where template files live
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    #[serde(default = "default_template_directory")]
    pub directory: PathBuf,

    #[serde(default = "default_template_extension")]
    pub extension: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            directory: default_template_directory(),
            extension: default_template_extension(),
        }
    }
}

fn default_template_directory() -> PathBuf {
    PathBuf::from("./templates")
}

fn default_template_extension() -> String {
    "txt".to_string()
}

/// Top-level configuration
///
/// ```ron
/// (
///     dispatch: (gate: (permits: 20)),
///     templates: (directory: "/etc/herald/templates"),
///     metrics: Some((endpoint: "http://collector:4318/v1/metrics")),
/// )
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub templates: TemplateConfig,

    /// Metrics are only exported when this section is present
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

impl HeraldConfig {
    /// Parse and validate a configuration document
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed RON and
    /// [`ConfigError::Invalid`] for values the engine rejects.
    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(content)?;
        config.dispatch.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the file at `path`
    ///
    /// # Errors
    ///
    /// See [`HeraldConfig::from_ron`]; also fails if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_ron(&content)
    }
}

/// Find the configuration file using the following precedence:
/// 1. an explicit path (`--config`)
/// 2. `HERALD_CONFIG` environment variable
/// 3. ./herald.config.ron (current working directory)
/// 4. /etc/herald/herald.config.ron (system-wide config)
///
/// # Errors
///
/// Returns [`ConfigError::Missing`] if an explicit or environment path does
/// not exist, and [`ConfigError::NotFound`] if no default path exists.
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let defaults: Vec<PathBuf> = DEFAULT_PATHS.iter().map(PathBuf::from).collect();
    locate(explicit, std::env::var_os(CONFIG_ENV).map(PathBuf::from), &defaults)
}

fn locate(
    explicit: Option<&Path>,
    from_env: Option<PathBuf>,
    defaults: &[PathBuf],
) -> Result<PathBuf, ConfigError> {
    let chosen = explicit
        .map(|path| ("--config", path.to_path_buf()))
        .or_else(|| from_env.map(|path| (CONFIG_ENV, path)));

    if let Some((source_name, path)) = chosen {
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::Missing { source_name, path });
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let tried = std::iter::once(format!("  - {CONFIG_ENV} environment variable"))
        .chain(defaults.iter().map(|path| format!("  - {}", path.display())))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::NotFound { tried })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    fn write_config(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_explicit_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = write_config(dir.path(), "explicit.ron", "()");
        let from_env = write_config(dir.path(), "env.ron", "()");

        let found = locate(Some(&explicit), Some(from_env), &[]).unwrap();
        assert_eq!(found, explicit);
    }

    #[test]
    fn test_env_before_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let from_env = write_config(dir.path(), "env.ron", "()");
        let default = write_config(dir.path(), "herald.config.ron", "()");

        let found = locate(None, Some(from_env.clone()), &[default]).unwrap();
        assert_eq!(found, from_env);
    }

    #[test]
    fn test_missing_env_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let default = write_config(dir.path(), "herald.config.ron", "()");

        let error = locate(None, Some(dir.path().join("nope.ron")), &[default]).unwrap_err();
        assert!(matches!(error, ConfigError::Missing { source_name: CONFIG_ENV, .. }));
    }

    #[test]
    fn test_first_existing_default() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.ron");
        let present = write_config(dir.path(), "present.ron", "()");

        let found = locate(None, None, &[absent, present.clone()]).unwrap();
        assert_eq!(found, present);
    }

    #[test]
    fn test_nothing_found_lists_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.ron");

        let error = locate(None, None, &[absent.clone()]).unwrap_err();
        let message = error.to_string();
        assert!(message.contains(CONFIG_ENV));
        assert!(message.contains(&absent.display().to_string()));
    }

    #[test]
    fn test_load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "herald.config.ron",
            r#"(
                dispatch: (
                    gate: (permits: 8),
                    transports: (
                        default: (host: "smtp.internal", from_address: "noreply@acme.test"),
                    ),
                ),
                templates: (directory: "/srv/templates", extension: "tmpl"),
                metrics: Some((enabled: false)),
            )"#,
        );

        let config = HeraldConfig::load(&path).unwrap();
        assert_eq!(config.dispatch.gate.permits, 8);
        assert_eq!(config.dispatch.transports.default.host, "smtp.internal");
        assert_eq!(config.templates.directory, PathBuf::from("/srv/templates"));
        assert_eq!(config.templates.extension, "tmpl");
        assert!(config.metrics.is_some_and(|metrics| !metrics.enabled));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../herald.config.ron");
        let config = HeraldConfig::load(&path).unwrap();

        let bank = &config.dispatch.transports.domains["bank.example.com"];
        assert_eq!(bank.address(), "relay.bank.example.com:465");
        assert_eq!(bank.credential.as_deref(), Some("bank-relay"));
        assert_eq!(
            config.dispatch.domain_rate_limits.overrides["bank.example.com"].max_wait_ms,
            250
        );
        assert_eq!(config.dispatch.maintenance.preload_domains, ["bank.example.com"]);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HeraldConfig::from_ron("()").unwrap();
        assert_eq!(config.dispatch.gate.permits, 100);
        assert_eq!(config.templates.extension, "txt");
        assert!(config.metrics.is_none());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let error = HeraldConfig::from_ron("(dispatch: (batch: (batch_size: 0)))").unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));

        let error = HeraldConfig::from_ron("(dispatch: (gate: (permits: \"many\")))").unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn test_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let error = HeraldConfig::load(&dir.path().join("missing.ron")).unwrap_err();
        assert!(matches!(error, ConfigError::Read { .. }));
    }
}
