//! Configuration for a Coffer store
//!
//! Plain value struct with validation; no global state.

/// Store configuration: size limits and WAL rotation threshold.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// WAL file size at which should_rotate() reports true (bytes)
    pub wal_max_size: u64,
}

impl Config {
    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_key_size == 0 || self.max_key_size > 64 * 1024 {
            return Err("max_key_size must be in [1, 64KiB]".into());
        }
        if self.max_value_size == 0 || self.max_value_size > 128 * 1024 * 1024 {
            return Err("max_value_size must be in [1, 128MiB]".into());
        }
        if self.wal_max_size < 4 * 1024 {
            return Err("wal_max_size must be >= 4KiB".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_key_size: 1024,
            max_value_size: 1024 * 1024,
            wal_max_size: 16 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_key_size_rejected() {
        let mut config = Config::default();
        config.max_key_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_wal_rejected() {
        let mut config = Config::default();
        config.wal_max_size = 100;
        assert!(config.validate().is_err());
    }
}
