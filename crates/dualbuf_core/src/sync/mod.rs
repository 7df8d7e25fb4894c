//! # Read-Mostly Synchronization
//!
//! ## The Problem
//!
//! ```text
//! Threads 1..N (request handlers):  READ the routing table, constantly
//! Thread  M    (control plane):     REWRITE the routing table, rarely
//!
//! With RwLock: every read bounces the same cache line between cores
//! With Mutex:  readers queue behind each other and behind the writer
//! ```
//!
//! ## The Solution: Doubly Buffered Data
//!
//! ```text
//! Readers:  lock OWN gate ──> read foreground ──> unlock OWN gate
//!
//! Updater:  write background
//!           flip foreground <-> background
//!           lock+unlock every reader gate (waits for old reads only)
//!           write the other instance the same way
//! ```
//!
//! Readers never share a lock with each other. The updater pays for it.

mod doubly_buffered;
mod reader;

pub use doubly_buffered::{DoublyBuffered, Modification, ReadGuard, StoreStats};
pub use reader::StoreId;
