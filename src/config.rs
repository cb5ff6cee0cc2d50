use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::store::Workspace;

pub const DEFAULT_CONFIG_FILE: &str = "kira-tm.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub data: Option<Utf8PathBuf>,
    #[serde(default)]
    pub allow_second_embryo: Option<bool>,
    #[serde(default)]
    pub veterinarian: Option<String>,
    #[serde(default)]
    pub technician: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub data_path: Utf8PathBuf,
    pub allow_second_embryo: bool,
    pub veterinarian: Option<String>,
    pub technician: Option<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `kira-tm.json` in the working directory when no path
    /// is given. Only an explicit path is required to exist.
    pub fn resolve(
        path: Option<&str>,
        workspace: &Workspace,
    ) -> Result<ResolvedConfig, TransferError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Self::resolve_config(Config::default(), workspace);
        }

        let config = Self::read(&config_path)?;
        Self::resolve_config(config, workspace)
    }

    pub fn resolve_config(
        config: Config,
        workspace: &Workspace,
    ) -> Result<ResolvedConfig, TransferError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(TransferError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        Ok(ResolvedConfig {
            schema_version,
            data_path: config
                .data
                .unwrap_or_else(|| workspace.default_data_path()),
            allow_second_embryo: config.allow_second_embryo.unwrap_or(false),
            veterinarian: non_blank(config.veterinarian),
            technician: non_blank(config.technician),
        })
    }

    fn read(path: &Utf8Path) -> Result<Config, TransferError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| TransferError::ConfigRead(path.to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| TransferError::ConfigParse(err.to_string()))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
