use anyhow::{bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Main configuration structure for gitvault
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Base directory holding one subdirectory of bare clones per source
    pub clone_base_dir: String,

    /// Backup behavior settings
    #[serde(default)]
    pub backup: BackupConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Repository sources, processed in order
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

/// Backup behavior settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackupConfig {
    /// Maximum repositories processed in parallel within one source
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Overwrite diverged published refs after backing up the old target
    #[serde(default)]
    pub accept_diverged: bool,

    /// Repository full-name exclusion patterns (glob-style)
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String, // "info"
}

/// One configured repository source
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceEntry {
    /// Label for this source; becomes the subdirectory under clone_base_dir
    pub name: String,

    #[serde(flatten)]
    pub provider: ProviderConfig,
}

/// Provider-specific source configuration, tagged by provider kind
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Explicit name -> URL map reachable with plain git transport
    PlainGit {
        #[serde(default)]
        repos: BTreeMap<String, String>,

        /// Private SSH key offered for ssh:// remotes
        #[serde(default)]
        key_path: Option<String>,
    },

    /// Repositories of the authenticated GitHub user
    Github { token: String },

    /// Projects owned by the authenticated GitLab user
    Gitlab {
        token: String,

        /// Instance URL, for self-hosted GitLab
        #[serde(default = "default_gitlab_url")]
        url: String,
    },
}

// Default value functions
fn default_max_parallel() -> usize {
    4
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_gitlab_url() -> String {
    "https://gitlab.com".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            accept_diverged: false,
            exclude_patterns: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clone_base_dir: "${HOME}/backups/git".to_string(),
            backup: BackupConfig::default(),
            logging: LoggingConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }
            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("gitvault").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.clone_base_dir = shellexpand::full(&self.clone_base_dir)
            .context("Failed to expand clone_base_dir path")?
            .into_owned();

        Ok(())
    }

    /// Reject source labels that would collide or escape the base directory.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for entry in &self.sources {
            let name = entry.name.as_str();
            if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                bail!("source name {:?} is not a safe directory name", name);
            }
            if !seen.insert(name) {
                bail!("source name {:?} is used more than once", name);
            }
        }
        Ok(())
    }
}
