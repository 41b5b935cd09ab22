use serde::{Deserialize, Serialize};
use crate::{CaptureError, Result};

/// Upper bound on the number of surfaces the OS capture pool may allocate.
pub const MAX_OS_BUFFERS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Read the newest frame and leave it buffered for other readers.
    #[default]
    Latest,
    /// Read the newest frame and drop everything buffered.
    LatestAndClear,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Frames buffered between the arrival callback and readers.
    pub pool_capacity: usize,
    /// Surfaces the OS capture pool writes into before recycling.
    pub os_buffers: u32,
    pub read_mode: ReadMode,
    /// Fall back to a software adapter when no hardware device is available.
    pub software_fallback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 2,
            os_buffers: 2,
            read_mode: ReadMode::Latest,
            software_fallback: true,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(CaptureError::InvalidConfig(
                "pool_capacity must be at least 1".into(),
            ));
        }

        if self.os_buffers == 0 || self.os_buffers > MAX_OS_BUFFERS {
            return Err(CaptureError::InvalidConfig(format!(
                "os_buffers must be 1-{}",
                MAX_OS_BUFFERS
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_limits() {
        let mut config = SessionConfig::default();
        config.pool_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.os_buffers = MAX_OS_BUFFERS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            pool_capacity = 4
            read_mode = "latest_and_clear"
            "#,
        )
        .unwrap();

        assert_eq!(config.pool_capacity, 4);
        assert_eq!(config.read_mode, ReadMode::LatestAndClear);
        assert_eq!(config.os_buffers, 2);
        assert!(config.software_fallback);
    }
}
