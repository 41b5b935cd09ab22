use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use fg_capture::SessionConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// Distinct frames to write before exiting
    pub frames: u32,
    pub poll_interval_ms: u64,
    /// Give up after this long without reaching `frames`
    pub timeout_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("frames"),
            frames: 1,
            poll_interval_ms: 5,
            timeout_ms: 5000,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents)
            .context("Failed to parse config file")?;

        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;

        if self.output.frames == 0 {
            anyhow::bail!("Invalid frame count (must be at least 1)");
        }

        if self.output.poll_interval_ms == 0 || self.output.poll_interval_ms > 1000 {
            anyhow::bail!("Invalid poll interval (must be 1-1000 ms)");
        }

        if self.output.timeout_ms < self.output.poll_interval_ms {
            anyhow::bail!("Timeout must be at least one poll interval");
        }

        Ok(())
    }
}
