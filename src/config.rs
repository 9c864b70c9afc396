use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from bootwatch.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub command: CommandConfig,
    pub scan: ScanConfig,
    pub output: OutputConfig,
}

/// How to invoke the emulator. `{image}` in any argument is replaced with
/// the image path.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Appended when guest verbosity is requested.
    pub verbose_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub marker: String,
    pub budget_secs: u64,
    pub poll_quantum_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub echo: bool,
    pub transcript: Option<PathBuf>,
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl HarnessConfig {
    /// Load config from `path`. A missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Reject settings the scanner cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.program.trim().is_empty() {
            return Err(ConfigError::Invalid("command.program is empty".into()));
        }
        if self.scan.marker.is_empty() {
            return Err(ConfigError::Invalid("scan.marker is empty".into()));
        }
        if self.scan.budget_secs == 0 {
            return Err(ConfigError::Invalid("scan.budget_secs must be > 0".into()));
        }
        if self.scan.poll_quantum_ms == 0 {
            return Err(ConfigError::Invalid(
                "scan.poll_quantum_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl ScanConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }

    pub fn quantum(&self) -> Duration {
        Duration::from_millis(self.poll_quantum_ms)
    }
}

// --- Default implementations ---

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: "archsim".to_string(),
            args: vec![
                "-m".to_string(),
                "arm-system".to_string(),
                "-l".to_string(),
                "contiguous".to_string(),
                "-s".to_string(),
                "arm926".to_string(),
                "--sys-model".to_string(),
                "sa".to_string(),
                "-e".to_string(),
                "{image}".to_string(),
            ],
            verbose_args: vec!["--verbose".to_string()],
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            marker: "BOOT OK".to_string(),
            budget_secs: 30,
            poll_quantum_ms: 1000,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            echo: true,
            transcript: None,
        }
    }
}
