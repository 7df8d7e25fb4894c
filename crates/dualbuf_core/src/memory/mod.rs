//! # Memory Management
//!
//! Pre-allocated storage for per-thread reader bookkeeping.
//!
//! ## Design Philosophy
//!
//! Reader slots are reserved when the store is created. Registering and
//! unregistering reader threads reuses them, and the registry only allocates
//! again when more threads read at once than ever before.

mod pool;

pub use pool::{SlotHandle, SlotPool};
