//! # Doubly Buffered Data
//!
//! Almost lock-free reads, paid for by much slower updates.
//!
//! ## Safety Note
//!
//! This module requires unsafe code to hand out `&T` and `&mut T` into the
//! two instances. Every unsafe block names the protocol step that makes it
//! sound.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────────────────────────────┐
//!                  │          DoublyBuffered<T, L>        │
//!                  │                                      │
//!                  │   ┌──────────┐      ┌──────────┐     │
//!                  │   │ Instance │      │ Instance │     │
//!                  │   │    0     │      │    1     │     │
//!                  │   └────┬─────┘      └────┬─────┘     │
//!                  │        └───────┬─────────┘           │
//!                  │   ┌────────────┴────────────┐        │
//!                  │   │ Atomic foreground (0/1) │        │
//!                  │   └─────────────────────────┘        │
//!                  │   update_lock    ReaderRegistry<L>   │
//!                  └──────────────────────────────────────┘
//!                         │                    │
//!              ┌──────────┘                    └──────────┐
//!              ▼                                          ▼
//!      ┌───────────────┐                        ┌───────────────────┐
//!      │   update(fn)  │  sweeps every gate ──> │ ReaderSlot per    │
//!      │ (one at once) │                        │ thread (gate + L) │
//!      └───────────────┘                        └───────────────────┘
//! ```
//!
//! ## Update Protocol
//!
//! 1. Lock `update_lock`.
//! 2. Run `fn` on the background instance. No reader can see it.
//!    `Unchanged` stops here: no flip, nothing published.
//! 3. Flip the foreground index. New reads see the fresh instance.
//! 4. Lock and unlock every reader gate. Reads that started before the
//!    flip are over once this returns.
//! 5. Run `fn` again on the old foreground, which nobody reads any more.
//!    Both runs must report the same result.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::error::AcquisitionResult;
use crate::sync::reader::{self, ActiveRead, ReaderRegistry, StoreId};

/// Outcome reported by an update function.
///
/// `Unchanged` means the function left the instance as it was. The store then
/// skips the flip and the second application entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use]
pub enum Modification<R = ()> {
    /// The instance was modified; carries the function's result.
    Applied(R),
    /// Nothing changed.
    Unchanged,
}

impl<R> Modification<R> {
    /// Returns true for [`Modification::Applied`].
    #[inline]
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Returns true for [`Modification::Unchanged`].
    #[inline]
    #[must_use]
    pub const fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }

    /// Returns the result of an applied update.
    #[inline]
    #[must_use]
    pub fn applied(self) -> Option<R> {
        match self {
            Self::Applied(r) => Some(r),
            Self::Unchanged => None,
        }
    }
}

/// Point-in-time counters of a store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of flips performed.
    pub generation: u64,
    /// Updates that changed the data.
    pub applied_updates: u64,
    /// Updates whose function reported `Unchanged`.
    pub unchanged_updates: u64,
    /// Threads currently registered as readers.
    pub registered_readers: usize,
    /// Time the latest update spent waiting for readers.
    pub last_sweep: Duration,
}

/// Two instances of `T`: one read by everybody, one written by the updater.
///
/// `L` is optional per-thread user data, created with `L::default()` on a
/// thread's first read and reachable through [`ReadGuard::tls`].
///
/// Reads lock only a mutex private to the calling thread, which is contended
/// only while an updater waits for that very thread. Updates run the update
/// function twice and wait for every registered reader thread once.
///
/// ## Usage
///
/// ```rust
/// use dualbuf_core::{DoublyBuffered, Modification};
///
/// let servers = DoublyBuffered::new(vec![String::from("10.0.0.1")]);
///
/// // Any thread, any time
/// {
///     let read = servers.read().unwrap();
///     assert_eq!(read.len(), 1);
/// }
///
/// // Runs once per instance
/// let added = servers.update(|list| {
///     if list.iter().any(|s| s == "10.0.0.2") {
///         return Modification::Unchanged;
///     }
///     list.push(String::from("10.0.0.2"));
///     Modification::Applied(list.len())
/// });
/// assert_eq!(added, Modification::Applied(2));
/// assert_eq!(servers.read().unwrap().len(), 2);
/// ```
pub struct DoublyBuffered<T, L = ()> {
    /// The two instances.
    /// Using UnsafeCell because the update protocol decides who may touch which.
    instances: [UnsafeCell<T>; 2],

    /// Index of the foreground instance (0 or 1).
    /// Background is always (foreground ^ 1).
    foreground: AtomicUsize,

    /// Serializes updates.
    update_lock: Mutex<()>,

    /// Per-thread reader slots.
    registry: Arc<ReaderRegistry<L>>,

    id: StoreId,
    config: StoreConfig,

    generation: AtomicU64,
    applied_updates: AtomicU64,
    unchanged_updates: AtomicU64,
    last_sweep_ns: AtomicU64,
}

impl<T: Clone> DoublyBuffered<T> {
    /// Creates a store whose instances both start as `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_config(value, StoreConfig::default())
    }

    /// Creates a store with an explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics if `config.reader_capacity` is zero.
    #[must_use]
    pub fn with_config(value: T, config: StoreConfig) -> Self {
        Self::from_instances(value.clone(), value, config)
    }
}

impl<T> DoublyBuffered<T> {
    /// Creates a store from two equivalent instances, for `T` without `Clone`.
    #[must_use]
    pub fn with_instances(first: T, second: T) -> Self {
        Self::from_instances(first, second, StoreConfig::default())
    }
}

impl<T, L> DoublyBuffered<T, L>
where
    L: Default + Send + 'static,
{
    /// Creates a store from two equivalent instances and a configuration.
    ///
    /// This is the constructor to use for stores with per-thread data `L`.
    ///
    /// # Panics
    ///
    /// Panics if `config.reader_capacity` is zero.
    #[must_use]
    pub fn from_instances(first: T, second: T, config: StoreConfig) -> Self {
        let id = StoreId::next();
        let registry = Arc::new(ReaderRegistry::new(
            id,
            config.name.clone(),
            config.reader_capacity,
        ));

        tracing::debug!(
            store = %config.name,
            store_id = %id,
            reader_capacity = config.reader_capacity,
            "doubly buffered store created"
        );

        Self {
            instances: [UnsafeCell::new(first), UnsafeCell::new(second)],
            foreground: AtomicUsize::new(0),
            update_lock: Mutex::new(()),
            registry,
            id,
            config,
            generation: AtomicU64::new(0),
            applied_updates: AtomicU64::new(0),
            unchanged_updates: AtomicU64::new(0),
            last_sweep_ns: AtomicU64::new(0),
        }
    }

    /// Pins the current foreground instance for as long as the guard lives.
    ///
    /// Never waits for updates in other threads, except for the instant an
    /// updater spends locking this thread's gate.
    ///
    /// # Errors
    ///
    /// - [`AcquisitionError::RegistryExhausted`](crate::AcquisitionError::RegistryExhausted)
    ///   if the reader registry could not allocate a slot for this thread.
    /// - [`AcquisitionError::ReentrantRead`](crate::AcquisitionError::ReentrantRead)
    ///   if this thread already holds a guard on this store.
    /// - [`AcquisitionError::ThreadExiting`](crate::AcquisitionError::ThreadExiting)
    ///   if called from a thread-local destructor.
    pub fn read(&self) -> AcquisitionResult<ReadGuard<'_, T, L>> {
        // Gate first, index second: once the gate is ours, an updater that
        // flips afterwards waits for us before touching this instance again.
        let active = reader::begin(&self.registry)?;
        let index = self.foreground.load(Ordering::Acquire);

        // SAFETY: `index` is the foreground. The updater only writes the
        // background, and cannot reclaim this instance before it has locked
        // our gate, which we hold until the guard drops.
        let instance = unsafe { &*self.instances[index].get() };

        Ok(ReadGuard {
            instance,
            index,
            active,
        })
    }

    /// Applies `update` to both instances.
    ///
    /// `update` runs twice, once per instance, with no copy in between. It
    /// must be deterministic: equal starting instances and the same captures
    /// must produce equal instances and equal results.
    ///
    /// Returns [`Modification::Unchanged`] without publishing anything if the
    /// first run reports `Unchanged`.
    ///
    /// # Panics
    ///
    /// If the calling thread holds a [`ReadGuard`] on this store; the update
    /// would wait for that guard forever.
    ///
    /// # Aborts
    ///
    /// If the two runs return different results, or either run panics, the
    /// process is aborted. The instances may disagree at that point and no
    /// later read could be trusted.
    pub fn update<R, F>(&self, update: F) -> Modification<R>
    where
        F: Fn(&mut T) -> Modification<R>,
        R: PartialEq + fmt::Debug,
    {
        self.apply(|background, _| update(background))
    }

    /// Like [`update`](Self::update), with read access to the other instance.
    ///
    /// On the first run the other instance is the current foreground. On the
    /// second run it is the instance published by the first run.
    ///
    /// # Panics
    ///
    /// Same as [`update`](Self::update), which also describes when the
    /// process is aborted.
    pub fn update_with_foreground<R, F>(&self, update: F) -> Modification<R>
    where
        F: Fn(&mut T, &T) -> Modification<R>,
        R: PartialEq + fmt::Debug,
    {
        self.apply(update)
    }

    /// Applies a modification that always counts as a change.
    ///
    /// # Panics
    ///
    /// If the calling thread holds a [`ReadGuard`] on this store.
    pub fn modify<F>(&self, modify: F)
    where
        F: Fn(&mut T),
    {
        let _ = self.apply(|background, _| {
            modify(background);
            Modification::Applied(())
        });
    }

    fn apply<R, F>(&self, update: F) -> Modification<R>
    where
        F: Fn(&mut T, &T) -> Modification<R>,
        R: PartialEq + fmt::Debug,
    {
        assert!(
            !reader::is_reading(self.id),
            "Update on store {} while this thread holds a read guard on it!",
            self.id
        );

        // A separate lock from the registry's, so threads registering or
        // exiting are not held up by a long update.
        let _update = self.update_lock.lock();
        let started = Instant::now();

        let old_foreground = self.foreground.load(Ordering::Acquire);
        let background = old_foreground ^ 1;

        // A panic inside `update` leaves the instances out of step.
        let abort_on_unwind = AbortOnUnwind { store: self.id };

        // SAFETY: we hold `update_lock`, so we are the only writer, and no
        // reader ever dereferences the background index.
        let first = unsafe {
            update(
                &mut *self.instances[background].get(),
                &*self.instances[old_foreground].get(),
            )
        };

        let Modification::Applied(first) = first else {
            std::mem::forget(abort_on_unwind);
            self.unchanged_updates.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(store = %self.config.name, "update reported no change, not flipping");
            return Modification::Unchanged;
        };

        // Publish
        self.foreground.store(background, Ordering::Release);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let sweep_started = Instant::now();
        let swept = self.registry.wait_readers_done();
        let sweep = sweep_started.elapsed();

        // SAFETY: every read that could have picked `old_foreground` held a
        // gate we have since locked; reads starting later load the new index.
        // We still hold `update_lock`.
        let second = unsafe {
            update(
                &mut *self.instances[old_foreground].get(),
                &*self.instances[background].get(),
            )
        };
        std::mem::forget(abort_on_unwind);

        if !matches!(&second, Modification::Applied(r) if *r == first) {
            tracing::error!(
                store = %self.config.name,
                store_id = %self.id,
                generation,
                first = ?first,
                second = ?second,
                "update function diverged between instances, aborting"
            );
            // Unwinding would leave a usable store whose instances disagree.
            std::process::abort();
        }

        self.applied_updates.fetch_add(1, Ordering::Relaxed);
        self.last_sweep_ns.store(
            u64::try_from(sweep.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        tracing::trace!(
            store = %self.config.name,
            generation,
            readers = swept,
            sweep = ?sweep,
            total = ?started.elapsed(),
            "update applied"
        );

        second
    }
}

impl<T, L> DoublyBuffered<T, L> {
    /// Returns this store's process-unique id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> StoreId {
        self.id
    }

    /// Returns the configuration the store was built with.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the number of flips so far.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Returns the current foreground index (for debugging).
    #[inline]
    #[must_use]
    pub fn foreground_index(&self) -> usize {
        self.foreground.load(Ordering::Acquire)
    }

    /// Returns the number of threads currently registered as readers.
    #[must_use]
    pub fn registered_readers(&self) -> usize {
        self.registry.len()
    }

    /// Returns a snapshot of the store's counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            generation: self.generation(),
            applied_updates: self.applied_updates.load(Ordering::Relaxed),
            unchanged_updates: self.unchanged_updates.load(Ordering::Relaxed),
            registered_readers: self.registered_readers(),
            last_sweep: Duration::from_nanos(self.last_sweep_ns.load(Ordering::Relaxed)),
        }
    }

    /// Returns `(foreground, background)`.
    ///
    /// Exclusive access means no read or update is in flight.
    #[must_use]
    pub fn instances(&mut self) -> (&T, &T) {
        let foreground = *self.foreground.get_mut();
        let [first, second] = &mut self.instances;
        let (first, second) = (&*first.get_mut(), &*second.get_mut());
        if foreground == 0 {
            (first, second)
        } else {
            (second, first)
        }
    }
}

/// Aborts the process when dropped. Forgotten once `update` has returned
/// for the last time.
struct AbortOnUnwind {
    store: StoreId,
}

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        tracing::error!(
            store_id = %self.store,
            "update function panicked, aborting"
        );
        std::process::abort();
    }
}

impl<T, L> Default for DoublyBuffered<T, L>
where
    T: Default,
    L: Default + Send + 'static,
{
    fn default() -> Self {
        Self::from_instances(T::default(), T::default(), StoreConfig::default())
    }
}

impl<T, L> fmt::Debug for DoublyBuffered<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoublyBuffered")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("foreground", &self.foreground_index())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl<T, L> Drop for DoublyBuffered<T, L> {
    fn drop(&mut self) {
        let released = self.registry.detach_all();
        tracing::debug!(
            store = %self.config.name,
            store_id = %self.id,
            released,
            "doubly buffered store dropped"
        );
    }
}

// SAFETY: readers on any thread share `&T`, so `T: Sync`; the updater on any
// thread gets `&mut T`, so `T: Send`. The protocol above keeps the two apart.
unsafe impl<T: Send + Sync, L: Send> Sync for DoublyBuffered<T, L> {}

/// Read guard over the foreground instance.
///
/// The instance stays valid and unchanged until the guard drops, even if
/// updates start and finish meanwhile. Hold it briefly: an update waits for
/// it, and no update can run on this thread while it is held.
///
/// ## Usage
///
/// ```rust
/// use dualbuf_core::DoublyBuffered;
///
/// let weights = DoublyBuffered::new([1u32, 2, 3]);
/// let read = weights.read().unwrap();
/// assert_eq!(read.iter().sum::<u32>(), 6);
/// // Handle is released when it goes out of scope
/// ```
pub struct ReadGuard<'a, T, L = ()> {
    instance: &'a T,
    index: usize,
    active: ActiveRead<L>,
}

impl<T, L> ReadGuard<'_, T, L> {
    /// Returns the instance index this guard reads from (for debugging).
    #[inline]
    #[must_use]
    pub fn foreground_index(&self) -> usize {
        self.index
    }

    /// Returns this thread's user data for the store.
    ///
    /// Created on the thread's first read and kept until the thread exits.
    /// If the store is dropped first, the data is dropped on the thread's
    /// next read of any store.
    #[inline]
    #[must_use]
    pub fn tls(&self) -> &L {
        self.active.tls()
    }

    /// Returns this thread's user data for the store, mutably.
    #[inline]
    pub fn tls_mut(&mut self) -> &mut L {
        self.active.tls_mut()
    }
}

impl<T, L> Deref for ReadGuard<'_, T, L> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.instance
    }
}

impl<T: fmt::Debug, L> fmt::Debug for ReadGuard<'_, T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard")
            .field("index", &self.index)
            .field("instance", self.instance)
            .finish()
    }
}
