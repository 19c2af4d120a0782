//! Agent configuration.
//!
//! Settings are layered: built-in defaults, then a TOML file, then
//! `IMGFAC_*` environment variables. Nested keys use `__` in the environment,
//! e.g. `IMGFAC_BUILDER__COMMAND=/usr/libexec/imgfac-builder`.

use crate::transport::{ConnectionOptions, ConnectionTarget, RetryPolicy};
use crate::types::AgentError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "IMGFAC";

/// Top-level agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker to connect to: `host`, `host:port`, or `tcp://host:port`. The
    /// broker must speak `Content-Length` framed JSON, not AMQP.
    pub broker: String,
    /// Re-establish the session when the broker connection drops.
    pub reconnect: bool,
    pub retry: RetryPolicy,
    pub builder: BuilderConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            reconnect: true,
            retry: RetryPolicy::default(),
            builder: BuilderConfig::default(),
        }
    }
}

/// How build processes are started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Builder executable; looked up on `PATH` unless absolute.
    pub command: String,
    /// Arguments placed before the operation name.
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            command: "imgfac-builder".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
        }
    }
}

impl AgentConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("imgfac").join("agent.toml"))
    }

    /// Load configuration from `path` (required to exist) or, when `None`,
    /// from the default location if present. Environment variables override
    /// both.
    pub fn load(path: Option<&str>) -> Result<Self, AgentError> {
        let file = match path {
            Some(path) => Some((PathBuf::from(expand(path)?), true)),
            None => Self::default_path().map(|p| (p, false)),
        };
        Self::build(file.as_ref().map(|(p, r)| (p.as_path(), *r)), true)
    }

    /// Load configuration from a file only, ignoring the environment.
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        Self::build(Some((path, true)), false)
    }

    fn build(file: Option<(&Path, bool)>, use_env: bool) -> Result<Self, AgentError> {
        let mut builder = config::Config::builder();

        if let Some((path, required)) = file {
            debug!(path = %path.display(), required, "Reading agent configuration");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(required),
            );
        }

        if use_env {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let mut config: AgentConfig = builder.build()?.try_deserialize()?;
        config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) -> Result<(), AgentError> {
        self.builder.command = expand(&self.builder.command)?;
        if let Some(ref dir) = self.builder.working_directory {
            let dir = expand(&dir.to_string_lossy())?;
            self.builder.working_directory = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), AgentError> {
        self.target()?;
        if self.builder.command.trim().is_empty() {
            return Err(AgentError::Config("builder.command must not be empty".to_string()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(AgentError::Config(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed broker address.
    pub fn target(&self) -> Result<ConnectionTarget, AgentError> {
        self.broker.parse()
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            reconnect: self.reconnect,
            retry: self.retry.clone(),
        }
    }
}

fn expand(value: &str) -> Result<String, AgentError> {
    shellexpand::full(value)
        .map(|s| s.into_owned())
        .map_err(|e| AgentError::Config(format!("cannot expand '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.broker, "localhost");
        assert!(config.reconnect);
        assert_eq!(config.builder.command, "imgfac-builder");
        assert_eq!(config.target().unwrap(), ConnectionTarget::new("localhost", 5672));
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
broker = "tcp://qpid.example.com:5673"
reconnect = false

[retry]
max_attempts = 3

[builder]
command = "/usr/libexec/imgfac-builder"
args = ["--verbose"]

[builder.env]
builder_log = "debug"
"#,
        );

        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.target().unwrap(), ConnectionTarget::new("qpid.example.com", 5673));
        assert!(!config.reconnect);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, RetryPolicy::default().initial_delay_ms);
        assert_eq!(config.builder.command, "/usr/libexec/imgfac-builder");
        assert_eq!(config.builder.args, vec!["--verbose".to_string()]);
        assert_eq!(config.builder.env.get("builder_log").map(String::as_str), Some("debug"));

        let options = config.connection_options();
        assert!(!options.reconnect);
        assert_eq!(options.retry.max_attempts, 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config("broker = \"broker:6000\"\n");
        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.broker, "broker:6000");
        assert_eq!(config.builder, BuilderConfig::default());
    }

    #[test]
    fn test_working_directory_is_expanded() {
        let file = write_config("[builder]\nworking_directory = \"~/builds\"\n");
        let config = AgentConfig::from_file(file.path()).unwrap();
        let dir = config.builder.working_directory.unwrap();
        assert!(!dir.to_string_lossy().starts_with('~'));
        assert!(dir.ends_with("builds"));
    }

    #[test]
    fn test_invalid_broker_rejected() {
        let file = write_config("broker = \"http://localhost\"\n");
        let err = AgentConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, AgentError::InvalidTarget(_)));
    }

    #[test]
    fn test_missing_required_file() {
        let err = AgentConfig::from_file(Path::new("/nonexistent/imgfac/agent.toml")).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
