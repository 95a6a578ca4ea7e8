//! Configuration loading and root folder resolution
//!
//! Settings resolve in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)
//!
//! Tiers 1 and 2 are handled by each binary's clap `Args`; this module covers
//! the TOML file and compiled defaults. A missing or unreadable TOML file is
//! never fatal: a warning is logged and defaults are used.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::note_sequence::MAX_QUANTIZED_STEPS;
use crate::{Error, Result};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "PMG_ROOT_FOLDER";

/// Compiled-in defaults for the current platform
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub bind_address: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    pub log_level: String,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        Self {
            root_folder: default_root_folder(),
            bind_address: "0.0.0.0".to_string(),
            port: 5000,
            max_upload_bytes: 10 * 1024 * 1024,
            log_level: "info".to_string(),
        }
    }
}

/// Logging section of the TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter when RUST_LOG is unset (e.g. "info", "pmg_server=debug")
    pub level: Option<String>,
}

/// Continuation parameters; the defaults match what the generate endpoint has always used
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Number of steps to generate after the seed
    pub steps: u32,
    /// Sampling temperature (> 0)
    pub temperature: f64,
    /// Quantization grid applied to the seed
    pub steps_per_quarter: u32,
    /// Fixed RNG seed for reproducible output
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            steps: 20,
            temperature: 1.1,
            steps_per_quarter: 4,
            seed: None,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.steps_per_quarter == 0 {
            return Err(Error::Config(
                "generation.steps_per_quarter must be positive".to_string(),
            ));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(Error::Config(format!(
                "generation.temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.steps > MAX_QUANTIZED_STEPS {
            return Err(Error::Config(format!(
                "generation.steps must be at most {}, got {}",
                MAX_QUANTIZED_STEPS, self.steps
            )));
        }
        Ok(())
    }
}

/// Contents of `pmg-server.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub max_upload_bytes: Option<usize>,
    /// Reload the last session sequence at startup
    pub restore_session: Option<bool>,
    pub logging: LoggingConfig,
    pub generation: GenerationConfig,
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid TOML in {}: {}", path.display(), e)))
}

/// Load `explicit` if given, else the platform config file; fall back to defaults on any error
pub fn load_toml_config_or_default(explicit: Option<&Path>, module_name: &str) -> TomlConfig {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path(module_name) {
            Some(path) if path.exists() => path,
            _ => {
                info!("No config file found for {}, using defaults", module_name);
                return TomlConfig::default();
            }
        },
    };

    match load_toml_config(&path) {
        Ok(config) => {
            info!("Loaded config from {}", path.display());
            config
        }
        Err(e) => {
            warn!("Failed to load config {}: {} (using defaults)", path.display(), e);
            TomlConfig::default()
        }
    }
}

/// `<config_dir>/pmg/<module>.toml`, or `/etc/pmg/<module>.toml` on Linux when absent
pub fn default_config_path(module_name: &str) -> Option<PathBuf> {
    let file_name = format!("{}.toml", module_name);
    let user_config = dirs::config_dir().map(|d| d.join("pmg").join(&file_name));

    if cfg!(target_os = "linux") {
        if let Some(path) = &user_config {
            if path.exists() {
                return user_config;
            }
        }
        let system_config = PathBuf::from("/etc/pmg").join(&file_name);
        if system_config.exists() {
            return Some(system_config);
        }
    }
    user_config
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("pmg"))
        .unwrap_or_else(|| PathBuf::from("./pmg_data"))
}

/// Resolves the root folder across CLI, environment, TOML and default tiers
#[derive(Debug, Clone)]
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    toml_value: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            toml_value: None,
        }
    }

    pub fn with_cli(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml(mut self, config: &TomlConfig) -> Self {
        self.toml_value = config.root_folder.clone();
        self
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_value {
            return path.clone();
        }

        let root = CompiledDefaults::for_current_platform().root_folder;
        info!(
            "No root folder configured for {}, using default {}",
            self.module_name,
            root.display()
        );
        root
    }
}

/// Lays out the directories under the root folder
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    /// Temporary storage for uploads while they are parsed
    pub fn upload_dir(&self) -> PathBuf {
        self.root_folder.join("uploads")
    }

    /// Generated MIDI files
    pub fn output_dir(&self) -> PathBuf {
        self.root_folder.join("generated")
    }

    /// Persisted session sequence
    pub fn session_path(&self) -> PathBuf {
        self.root_folder.join("sequence.json")
    }

    /// Create the root, upload and output directories if missing
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.root_folder.clone(), self.upload_dir(), self.output_dir()] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
                info!("Created directory {}", dir.display());
            }
        }
        Ok(())
    }
}
