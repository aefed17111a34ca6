use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::prelude::*;
use crate::process::KillOptions;
use nestify::nest;
use procwatch_shared::{DEFAULT_COLLECTOR_HOST, DEFAULT_COLLECTOR_PORT};
use serde::{Deserialize, Serialize};

nest! {
    #[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]*
    #[serde(rename_all = "kebab-case", default)]*
    /// Persistent configuration for procwatch.
    ///
    /// Stored at `~/.config/procwatch/config.yaml` following the XDG Base Directory
    /// Specification. Every key is optional, missing ones take their default value.
    pub struct ProcwatchConfig {
        pub collector: pub struct CollectorSettings {
            /// Host the log handlers connect to
            pub host: String,
            pub port: u16,
            /// File written by the collector, truncated when it starts
            pub log_file: PathBuf,
        },
        pub kill: pub struct KillSettings {
            /// How long a process gets to exit after SIGTERM before being force killed
            pub timeout_ms: u64,
        },
    }
}

impl Default for ProcwatchConfig {
    fn default() -> Self {
        Self {
            collector: CollectorSettings::default(),
            kill: KillSettings::default(),
        }
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_COLLECTOR_HOST.to_string(),
            port: DEFAULT_COLLECTOR_PORT,
            log_file: PathBuf::from("log").join("shared.log"),
        }
    }
}

impl Default for KillSettings {
    fn default() -> Self {
        Self {
            timeout_ms: crate::process::DEFAULT_KILL_TIMEOUT.as_millis() as u64,
        }
    }
}

impl KillSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn kill_options(&self, raise_on_failure: bool) -> KillOptions {
        KillOptions {
            raise_on_failure,
            timeout: self.timeout(),
        }
    }
}

/// Get the path to the configuration file, following the XDG Base Directory Specification
/// at https://specifications.freedesktop.org/basedir-spec/basedir-spec-latest.html
///
/// If config_name is None, returns ~/.config/procwatch/config.yaml (default)
/// If config_name is Some, returns ~/.config/procwatch/{config_name}.yaml
fn get_configuration_file_path(config_name: Option<&str>) -> PathBuf {
    let config_dir = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(env::temp_dir);
    let config_dir = config_dir.join("procwatch");

    match config_name {
        Some(name) => config_dir.join(format!("{name}.yaml")),
        None => config_dir.join("config.yaml"),
    }
}

impl ProcwatchConfig {
    /// Load the configuration. If it does not exist, return a default configuration.
    pub fn load_with_override(config_name: Option<&str>) -> Result<Self> {
        Self::load_from_path(&get_configuration_file_path(config_name))
    }

    pub fn load_from_path(config_path: &Path) -> Result<Self> {
        match fs::read(config_path) {
            Ok(config_str) => {
                let config: ProcwatchConfig =
                    serde_yaml::from_slice(&config_str).context(format!(
                        "Failed to parse procwatch config at {}",
                        config_path.display()
                    ))?;
                debug!("Config loaded from {}", config_path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Config file not found at {}", config_path.display());
                Ok(ProcwatchConfig::default())
            }
            Err(e) => bail!("Failed to load config: {e}"),
        }
    }
}
