use beacon::config::Config as RelayConfig;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_yaml::Value;
use std::sync::LazyLock;

static ENV_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(\w+)\}").expect("placeholder pattern is valid"));

#[derive(Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".into()
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub relay: RelayConfig,
}

impl Config {
    /// Loads the YAML config at `path`, resolving `${VAR}` placeholders from the
    /// process environment.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw, |name| std::env::var(name).ok())
    }

    fn from_yaml<L>(raw: &str, lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut document: Value = serde_yaml::from_str(raw)?;
        substitute_env_vars(&mut document, &lookup)?;
        Ok(serde_yaml::from_value(document)?)
    }
}

/// Placeholders are replaced inside string values only, after parsing, so a
/// multi-line secret such as a PEM key cannot break the YAML structure.
fn substitute_env_vars<L>(value: &mut Value, lookup: &L) -> Result<(), ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            let mut missing = None;
            let replaced = ENV_PLACEHOLDER
                .replace_all(s.as_str(), |caps: &Captures| {
                    let name = &caps[1];
                    lookup(name).unwrap_or_else(|| {
                        missing.get_or_insert_with(|| name.to_string());
                        String::new()
                    })
                })
                .into_owned();
            if let Some(name) = missing {
                return Err(ConfigError::MissingEnvVar(name));
            }
            *s = replaced;
        }
        Value::Sequence(items) => {
            for item in items {
                substitute_env_vars(item, lookup)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute_env_vars(item, lookup)?;
            }
        }
        Value::Tagged(tagged) => substitute_env_vars(&mut tagged.value, lookup)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("environment variable {0} is not set")]
    MissingEnvVar(String),
}
