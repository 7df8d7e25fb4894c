//! # Error Types
//!
//! All recoverable errors raised by doubly buffered stores.
//!
//! Diverging updates are not represented here: they mean the two instances
//! no longer agree, which nothing downstream can repair, so the store panics.

use thiserror::Error;

/// Errors that can occur while acquiring a read guard.
///
/// None of these leave the store in a different state than before the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    /// The reader registry could not allocate a slot for this thread.
    #[error("reader registry exhausted: allocation failed with {registered} readers registered")]
    RegistryExhausted {
        /// Reader threads registered when the allocation failed.
        registered: usize,
    },

    /// The calling thread is tearing down its thread-local storage.
    #[error("thread is exiting, thread-local reader slots are gone")]
    ThreadExiting,

    /// The calling thread already holds a read guard on this store.
    #[error("thread already holds a read guard on store {store_id}")]
    ReentrantRead {
        /// Store the guard is held on.
        store_id: u64,
    },
}

/// Errors that can occur while loading a store configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration text is not valid TOML for [`crate::StoreConfig`].
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// A store needs room for at least one reader.
    #[error("reader capacity must be greater than zero")]
    ZeroReaderCapacity,
}

/// Result type for read acquisition.
pub type AcquisitionResult<T> = Result<T, AcquisitionError>;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;
