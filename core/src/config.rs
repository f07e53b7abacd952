use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name the configuration is loaded from, searched upward from the
/// working directory. The walker also skips files with this name so a
/// configuration inside the backed-up tree never ends up in a snapshot.
pub const CONFIG_NAME: &str = ".bolong.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Local,
    Googles3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleS3Config {
    pub access_key: String,
    pub secret: String,
    pub bucket: String,
    /// Object prefix, starting and ending with a slash.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub kind: StoreKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub googles3: Option<GoogleS3Config>,

    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,

    /// How many incrementals may follow a full backup before the next
    /// snapshot must itself be full. Zero means every snapshot is full.
    #[serde(default)]
    pub incrementals_per_full: u32,

    /// Keep the most recent N full backups and everything after them.
    /// Zero disables pruning of full backups.
    #[serde(default)]
    pub full_keep: u32,

    /// Keep incrementals only for the most recent N full backups.
    /// Zero disables pruning of incrementals.
    #[serde(default)]
    pub incremental_for_full_keep: u32,

    pub passphrase: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let data = std::fs::read(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("parsing {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Search for `.bolong.json` in `start` and its ancestors.
    pub fn find(start: &Path) -> Result<PathBuf> {
        for dir in start.ancestors() {
            let candidate = dir.join(CONFIG_NAME);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::Config(format!(
            "no {} found in {} or any parent directory",
            CONFIG_NAME,
            start.display()
        )))
    }

    pub fn validate(&self) -> Result<()> {
        if self.passphrase.is_empty() {
            return Err(Error::Config("passphrase must not be empty".into()));
        }
        match self.kind {
            StoreKind::Local => {
                if self.local.is_none() {
                    return Err(Error::Config(
                        r#"kind is "local" but no local section is present"#.into(),
                    ));
                }
            }
            StoreKind::Googles3 => {
                let Some(s3) = &self.googles3 else {
                    return Err(Error::Config(
                        r#"kind is "googles3" but no googles3 section is present"#.into(),
                    ));
                };
                if !s3.path.starts_with('/') || !s3.path.ends_with('/') {
                    return Err(Error::Config(
                        "googles3.path must start and end with a slash".into(),
                    ));
                }
            }
        }
        for pattern in self.include.iter().chain(self.exclude.iter()) {
            Regex::new(pattern)
                .map_err(|e| Error::Config(format!("bad pattern {:?}: {}", pattern, e)))?;
        }
        Ok(())
    }
}
