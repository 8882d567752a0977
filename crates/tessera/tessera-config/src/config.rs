use serde::Deserialize;
use std::path::Path;

/// Settings shared by the producer and consumer binaries.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TesseraConfig {
    /// Name of the POSIX shared-memory object.
    #[serde(default = "defaults::shm_url")]
    pub shm_url: String,
    /// Data bytes of the shared backend.
    #[serde(default = "defaults::backend_size")]
    pub backend_size: usize,
    #[serde(default = "defaults::queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "defaults::allocator_major")]
    pub allocator_major: u32,
    #[serde(default = "defaults::allocator_minor")]
    pub allocator_minor: u32,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Records the producer publishes before waiting for the consumer.
    #[serde(default = "defaults::records")]
    pub records: u64,
    /// Size of each process's private root heap.
    #[serde(default = "defaults::root_heap_size")]
    pub root_heap_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

mod defaults {
    pub fn shm_url() -> String {
        "/tessera_bus".into()
    }

    pub fn backend_size() -> usize {
        64 << 20
    }

    pub fn queue_depth() -> usize {
        1024
    }

    pub fn allocator_major() -> u32 {
        1
    }

    pub fn allocator_minor() -> u32 {
        0
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn records() -> u64 {
        1_000_000
    }

    pub fn root_heap_size() -> usize {
        4 << 20
    }
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            shm_url: defaults::shm_url(),
            backend_size: defaults::backend_size(),
            queue_depth: defaults::queue_depth(),
            allocator_major: defaults::allocator_major(),
            allocator_minor: defaults::allocator_minor(),
            log_level: defaults::log_level(),
            records: defaults::records(),
            root_heap_size: defaults::root_heap_size(),
        }
    }
}

impl TesseraConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: TesseraConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_size == 0 {
            return Err(ConfigError::Invalid("backend_size must be non-zero"));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be non-zero"));
        }
        if self.root_heap_size == 0 {
            return Err(ConfigError::Invalid("root_heap_size must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        assert_eq!(TesseraConfig::parse("").unwrap(), TesseraConfig::default());
    }

    #[test]
    fn fields_override_defaults() {
        let cfg = TesseraConfig::parse(
            r#"
            shm_url = "/bus_a"
            queue_depth = 64
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.shm_url, "/bus_a");
        assert_eq!(cfg.queue_depth, 64);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.backend_size, 64 << 20);
    }

    #[test]
    fn zero_depth_is_rejected() {
        assert!(matches!(
            TesseraConfig::parse("queue_depth = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            TesseraConfig::parse("queue_depth = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        match TesseraConfig::load("/nonexistent/tessera.toml") {
            Err(ConfigError::Read { path, .. }) => assert_eq!(path, "/nonexistent/tessera.toml"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
