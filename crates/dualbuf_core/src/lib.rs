//! # DUALBUF Core
//!
//! Doubly buffered data: a value kept twice so that reads are almost
//! lock-free while updates may be slow and multi-step. Designed for:
//! - Load balancer server lists read on every request
//! - Routing and configuration tables rewritten a few times per second
//! - Any read-mostly structure shared by many native threads
//!
//! ## Architecture Rules
//!
//! 1. **Readers never wait for each other** - each thread locks only its own gate
//! 2. **Readers never see a partial update** - writes go to the hidden instance
//! 3. **Updates are deterministic** - the update function runs once per instance
//!
//! ## Example
//!
//! ```rust
//! use dualbuf_core::{DoublyBuffered, Modification};
//!
//! let counter = DoublyBuffered::new(0u64);
//!
//! let _ = counter.update(|n| {
//!     *n += 1;
//!     Modification::Applied(())
//! });
//! assert_eq!(*counter.read().unwrap(), 1);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::StoreConfig;
pub use error::{AcquisitionError, AcquisitionResult, ConfigError, ConfigResult};
pub use memory::{SlotHandle, SlotPool};
pub use sync::{DoublyBuffered, Modification, ReadGuard, StoreId, StoreStats};
