//! # Store Configuration
//!
//! Sizing and labelling for a [`crate::DoublyBuffered`] store.
//!
//! ```rust
//! use dualbuf_core::StoreConfig;
//!
//! let config = StoreConfig::from_toml_str(
//!     r#"
//!     name = "load_balancer"
//!     reader_capacity = 512
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.reader_capacity, 512);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Configuration for a doubly buffered store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Label attached to every log event of the store.
    pub name: String,
    /// Reader slots reserved when the store is created.
    ///
    /// Not a limit: the registry grows when more threads read at once. A
    /// thread gives its slot back when it exits.
    pub reader_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: String::from("doubly_buffered"),
            reader_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// Server config: room for large thread-per-connection pools.
    #[must_use]
    pub fn server() -> Self {
        Self {
            reader_capacity: 4096,
            ..Self::default()
        }
    }

    /// Returns the config with a different log label.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the config with a different reader capacity.
    #[must_use]
    pub fn with_reader_capacity(mut self, reader_capacity: usize) -> Self {
        self.reader_capacity = reader_capacity;
        self
    }

    /// Parses a TOML document. Missing keys fall back to [`Default`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input and
    /// [`ConfigError::ZeroReaderCapacity`] if `reader_capacity` is zero.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values a store cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroReaderCapacity`] if `reader_capacity` is zero.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.reader_capacity == 0 {
            return Err(ConfigError::ZeroReaderCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = StoreConfig::from_toml_str("name = \"routes\"").unwrap();
        assert_eq!(config.name, "routes");
        assert_eq!(config.reader_capacity, StoreConfig::default().reader_capacity);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(StoreConfig::from_toml_str("").unwrap(), StoreConfig::default());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = StoreConfig::from_toml_str("reader_capacity = 0").unwrap_err();
        assert_eq!(err, ConfigError::ZeroReaderCapacity);
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let err = StoreConfig::from_toml_str("reader_capacity = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_builders() {
        let config = StoreConfig::server().with_name("lb").with_reader_capacity(8);
        assert_eq!(config.name, "lb");
        assert_eq!(config.reader_capacity, 8);
        assert!(config.validate().is_ok());
    }
}
