//! Configuration file support for flashbridge.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (FLASHBRIDGE_*)
//! 3. Local config file (./flashbridge.toml)
//! 4. Global config file (~/.config/flashbridge/config.toml)
//!
//! Environment variables are bound to the global flags by clap, so this module
//! only deals with the two files and with folding the flags on top.

use directories::ProjectDirs;
use flashbridge::{BridgeConfig, DEFAULT_BAUD, ToolConfig};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub(crate) const LOCAL_CONFIG: &str = "flashbridge.toml";

/// `[tool]` section. Every field is optional so files can be layered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSection {
    /// Path or name of the arduino-cli binary.
    pub binary: Option<PathBuf>,
    /// arduino-cli configuration file.
    pub config_file: Option<PathBuf>,
    /// Shared library directory.
    pub library_dir: Option<PathBuf>,
    /// Parent directory for build workspaces.
    pub work_root: Option<PathBuf>,
    /// Port discovery timeout in seconds.
    pub discovery_timeout: Option<u64>,
    /// Compile timeout in seconds.
    pub compile_timeout: Option<u64>,
    /// Single upload attempt timeout in seconds.
    pub upload_timeout: Option<u64>,
}

/// `[serial]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialSection {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Default monitor baud rate.
    pub baud: Option<u32>,
}

/// `[upload]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadSection {
    /// Default fully qualified board name.
    pub board: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Build/flash tool settings.
    #[serde(default)]
    pub tool: ToolSection,
    /// Serial settings.
    #[serde(default)]
    pub serial: SerialSection,
    /// Upload settings.
    #[serde(default)]
    pub upload: UploadSection,
}

/// Values given on the command line (or through their environment variables).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--port`.
    pub port: Option<String>,
    /// `--baud`.
    pub baud: Option<u32>,
    /// `--board`.
    pub board: Option<String>,
    /// `--arduino-cli`.
    pub tool_binary: Option<PathBuf>,
}

/// Effective settings after layering.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Port to operate on, if any.
    pub port: Option<String>,
    /// Baud rate for monitoring.
    pub baud: u32,
    /// Library configuration.
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .map_err(|e| warn!("Failed to parse config file {}: {e}", path.display()))
                .ok(),
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Parse TOML content.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "flashbridge").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Fields set in `other` win.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        let tool = other.tool;
        take(&mut self.tool.binary, tool.binary);
        take(&mut self.tool.config_file, tool.config_file);
        take(&mut self.tool.library_dir, tool.library_dir);
        take(&mut self.tool.work_root, tool.work_root);
        take(&mut self.tool.discovery_timeout, tool.discovery_timeout);
        take(&mut self.tool.compile_timeout, tool.compile_timeout);
        take(&mut self.tool.upload_timeout, tool.upload_timeout);

        take(&mut self.serial.port, other.serial.port);
        take(&mut self.serial.baud, other.serial.baud);
        take(&mut self.upload.board, other.upload.board);
    }

    /// Fold command-line overrides on top of the file configuration.
    pub fn resolve(&self, overrides: Overrides) -> Settings {
        let defaults = ToolConfig::default();
        let tool = ToolConfig {
            binary: overrides
                .tool_binary
                .or_else(|| self.tool.binary.clone())
                .unwrap_or(defaults.binary),
            config_file: self.tool.config_file.clone(),
            library_dir: self.tool.library_dir.clone(),
            work_root: self.tool.work_root.clone(),
            discovery_timeout_secs: self
                .tool
                .discovery_timeout
                .unwrap_or(defaults.discovery_timeout_secs),
            compile_timeout_secs: self
                .tool
                .compile_timeout
                .unwrap_or(defaults.compile_timeout_secs),
            upload_timeout_secs: self
                .tool
                .upload_timeout
                .unwrap_or(defaults.upload_timeout_secs),
        };

        Settings {
            port: overrides.port.or_else(|| self.serial.port.clone()),
            baud: overrides
                .baud
                .or(self.serial.baud)
                .unwrap_or(DEFAULT_BAUD),
            bridge: BridgeConfig {
                tool,
                default_board: overrides.board.or_else(|| self.upload.board.clone()),
            },
        }
    }
}
