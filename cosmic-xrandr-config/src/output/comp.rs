// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use tracing::{error, warn};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OutputState {
    #[serde(rename = "true")]
    Enabled,
    #[serde(rename = "false")]
    Disabled,
    /// Show the content of the named connector, scaled and cropped to its size.
    Mirroring(String),
}

fn default_state() -> OutputState {
    OutputState::Enabled
}

fn default_brightness() -> f64 {
    1.0
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed output configuration: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

/// All known output setups, keyed by the sorted list of connectors that were
/// present when the setup was stored.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputsConfig {
    pub config: HashMap<Vec<OutputInfo>, Vec<OutputConfig>>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OutputConfig {
    /// Mode size in pixels and an optional refresh rate in mHz.
    pub mode: ((i32, i32), Option<u32>),
    pub scale: f64,
    pub transform: TransformDef,
    pub position: (i32, i32),
    #[serde(default = "default_state")]
    pub enabled: OutputState,
    #[serde(default = "default_brightness")]
    pub brightness: f64,
    #[serde(default)]
    pub primary: bool,
}

impl Default for OutputConfig {
    fn default() -> OutputConfig {
        OutputConfig {
            mode: ((0, 0), None),
            scale: 1.0,
            transform: TransformDef::Normal,
            position: (0, 0),
            enabled: OutputState::Enabled,
            brightness: 1.0,
            primary: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputInfo {
    pub connector: String,
}

impl OutputsConfig {
    /// Looks up the stored setup for exactly this set of connectors.
    pub fn get(&self, connectors: &[String]) -> Option<Vec<(OutputInfo, OutputConfig)>> {
        let mut infos = connectors
            .iter()
            .map(|connector| OutputInfo {
                connector: connector.clone(),
            })
            .collect::<Vec<_>>();
        infos.sort();
        let configs = self.config.get(&infos)?;
        Some(infos.into_iter().zip(configs.iter().cloned()).collect())
    }

    pub fn insert(&mut self, mut outputs: Vec<(OutputInfo, OutputConfig)>) {
        outputs.sort_by(|(a, _), (b, _)| a.cmp(b));
        let (infos, configs) = outputs.into_iter().unzip();
        self.config.insert(infos, configs);
    }

    /// Replaces mirroring tags that point to unknown or non-enabled connectors.
    pub fn sanitize(&mut self) {
        for (info, config) in self.config.iter_mut() {
            let config_clone = config.clone();
            for conf in config.iter_mut() {
                if let OutputState::Mirroring(conn) = &conf.enabled {
                    if let Some((j, _)) = info
                        .iter()
                        .enumerate()
                        .find(|(_, info)| &info.connector == conn)
                    {
                        if config_clone[j].enabled != OutputState::Enabled {
                            warn!("Invalid Mirroring tag, overriding with `Enabled` instead");
                            conf.enabled = OutputState::Enabled;
                        }
                    } else {
                        warn!("Invalid Mirroring tag, overriding with `Enabled` instead");
                        conf.enabled = OutputState::Enabled;
                    }
                }
            }
        }
    }
}

pub fn load_outputs(path: Option<impl AsRef<Path>>) -> OutputsConfig {
    if let Some(path) = path.as_ref() {
        let path: &Path = path.as_ref();
        if path.exists() {
            match read_outputs(path) {
                Ok(mut config) => {
                    config.sanitize();
                    return config;
                }
                Err(err) => {
                    warn!(?err, "Failed to read output_config, resetting..");
                    if let Err(err) = std::fs::remove_file(path) {
                        error!(?err, "Failed to remove output_config.");
                    }
                }
            };
        }
    }

    OutputsConfig::default()
}

fn read_outputs(path: &Path) -> Result<OutputsConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(ron::from_str(&content)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformDef {
    Normal,
    _90,
    _180,
    _270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}
