//! # Per-Thread Reader Slots
//!
//! Every thread that reads a store owns one `ReaderSlot` for that store.
//! The slot's gate is locked for the whole duration of a read; an updater
//! locks and immediately unlocks every gate to wait for reads that may still
//! see the old foreground instance.
//!
//! ## Lifecycle
//!
//! ```text
//!   first read() on thread T
//!        │
//!        ├──> ReaderSlot created, registered in the store's ReaderRegistry
//!        └──> LocalEntry { slot, Weak<registry> } pushed to T's LOCAL_SLOTS
//!
//!   T exits                     store dropped
//!        │                           │
//!        └──> LocalEntry::drop       └──> registry drained, Weak dies
//!             upgrade Weak ──> remove     later LocalEntry::drop is a no-op
//! ```
//!
//! The registry owns slots through generation-tagged handles, so whichever
//! side runs second finds nothing left to remove.
//!
//! A thread's entry for a dropped store, and the user data in it, is pruned
//! on that thread's next read of any store, or at thread exit.

#![allow(unsafe_code)]

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{AcquisitionError, AcquisitionResult};
use crate::memory::{SlotHandle, SlotPool};

/// Process-unique identity of a store.
///
/// Keys the per-thread slot table. Never reused, so a thread-local entry
/// left behind by a dropped store can never be mistaken for a live one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(u64);

impl StoreId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The read-guard object of one thread for one store.
///
/// Holds the gate and the thread's user data. The user data is only touched
/// by the owning thread, and only while it holds the gate.
pub(crate) struct ReaderSlot<L> {
    gate: Mutex<()>,
    tls: UnsafeCell<L>,
}

// SAFETY: `tls` is only accessed by the owning thread while it holds `gate`.
// Other threads only lock and unlock `gate`.
unsafe impl<L: Send> Sync for ReaderSlot<L> {}

impl<L> ReaderSlot<L> {
    fn new(tls: L) -> Self {
        Self {
            gate: Mutex::new(()),
            tls: UnsafeCell::new(tls),
        }
    }

    /// Locks the gate until the matching `end_read`.
    #[inline]
    fn begin_read(&self) {
        std::mem::forget(self.gate.lock());
    }

    /// Unlocks the gate taken by `begin_read`. Only called from
    /// `ActiveRead::drop`, on the thread that called `begin_read`.
    #[inline]
    fn end_read(&self) {
        // SAFETY: the gate guard was forgotten in `begin_read` and no other
        // code path unlocks it.
        unsafe { self.gate.force_unlock() };
    }

    /// Blocks until the owning thread is between two reads.
    #[inline]
    fn wait_read_done(&self) {
        drop(self.gate.lock());
    }
}

/// Number of registries dropped so far in the process.
static DROPPED_REGISTRIES: AtomicU64 = AtomicU64::new(0);

/// Removal hook a thread-local entry calls on its way out.
trait SlotOwner: Send + Sync {
    fn release(&self, handle: SlotHandle);
}

/// The set of live reader slots of one store.
pub(crate) struct ReaderRegistry<L> {
    store_id: StoreId,
    name: String,
    slots: Mutex<SlotPool<Arc<ReaderSlot<L>>>>,
    /// Mirrors `slots.len()`. Readable without the lock, which a sweep may
    /// hold while waiting for the very thread asking.
    live: AtomicUsize,
}

impl<L> ReaderRegistry<L> {
    pub(crate) fn new(store_id: StoreId, name: String, capacity: usize) -> Self {
        Self {
            store_id,
            name,
            slots: Mutex::new(SlotPool::new(capacity)),
            live: AtomicUsize::new(0),
        }
    }

    /// Number of registered reader threads.
    pub(crate) fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Waits until no registered thread is inside a read that started
    /// before this call. Returns the number of slots visited.
    ///
    /// The registry lock is held for the whole sweep, so a thread registering
    /// concurrently does so after the sweep and already sees the new
    /// foreground index.
    pub(crate) fn wait_readers_done(&self) -> usize {
        let slots = self.slots.lock();
        let mut visited = 0;
        for (_, slot) in slots.iter() {
            slot.wait_read_done();
            visited += 1;
        }
        visited
    }

    /// Releases every slot. Thread-local entries pointing here become inert
    /// once the registry itself is gone.
    pub(crate) fn detach_all(&self) -> usize {
        let drained = {
            let mut slots = self.slots.lock();
            self.live.store(0, Ordering::Release);
            slots.drain()
        };
        drained.len()
    }

    fn register(&self, slot: Arc<ReaderSlot<L>>) -> AcquisitionResult<SlotHandle> {
        let mut slots = self.slots.lock();
        let reserved = slots.capacity();
        let inserted = slots.insert(slot);
        let registered = slots.len();
        self.live.store(registered, Ordering::Release);

        if slots.capacity() > reserved {
            tracing::debug!(
                store = %self.name,
                store_id = %self.store_id,
                slots = slots.capacity(),
                "reader registry grown"
            );
        }

        inserted.map_err(|_| {
            tracing::warn!(
                store = %self.name,
                store_id = %self.store_id,
                registered,
                "reader registry could not grow"
            );
            AcquisitionError::RegistryExhausted { registered }
        })
    }
}

impl<L> Drop for ReaderRegistry<L> {
    fn drop(&mut self) {
        // Every `Weak` to us is dead by now; threads that see the new count
        // will find their entries stale.
        DROPPED_REGISTRIES.fetch_add(1, Ordering::Release);
    }
}

impl<L: Send + 'static> SlotOwner for ReaderRegistry<L> {
    fn release(&self, handle: SlotHandle) {
        let mut slots = self.slots.lock();
        let removed = slots.remove(handle);
        self.live.store(slots.len(), Ordering::Release);
        drop(slots);
        if removed.is_some() {
            tracing::debug!(
                store = %self.name,
                store_id = %self.store_id,
                slot = handle.index(),
                "reader thread exited, slot released"
            );
        }
    }
}

/// One thread's membership in one store's registry.
struct LocalEntry {
    store_id: StoreId,
    slot: Arc<dyn Any + Send + Sync>,
    owner: Weak<dyn SlotOwner>,
    handle: SlotHandle,
    reading: Rc<Cell<bool>>,
}

impl Drop for LocalEntry {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.release(self.handle);
        }
    }
}

#[derive(Default)]
struct LocalSlots {
    entries: Vec<LocalEntry>,
    /// `DROPPED_REGISTRIES` as of the last prune.
    seen_dropped: u64,
}

impl LocalSlots {
    fn find(&self, store_id: StoreId) -> Option<&LocalEntry> {
        self.entries.iter().find(|e| e.store_id == store_id)
    }

    /// Removes entries of dead stores if any registry was dropped since the
    /// last call.
    fn take_dropped(&mut self) -> Vec<LocalEntry> {
        let dropped = DROPPED_REGISTRIES.load(Ordering::Acquire);
        if dropped == self.seen_dropped {
            return Vec::new();
        }
        self.seen_dropped = dropped;
        self.take_stale(None)
    }

    /// Removes entries of stores that no longer exist, plus `also` if given.
    fn take_stale(&mut self, also: Option<StoreId>) -> Vec<LocalEntry> {
        let mut stale = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let entry = &self.entries[i];
            if entry.owner.strong_count() == 0 || Some(entry.store_id) == also {
                stale.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        stale
    }
}

thread_local! {
    static LOCAL_SLOTS: RefCell<LocalSlots> = RefCell::new(LocalSlots::default());
}

/// A read in progress: the gate is held until this is dropped.
pub(crate) struct ActiveRead<L> {
    slot: Arc<ReaderSlot<L>>,
    reading: Rc<Cell<bool>>,
}

impl<L> ActiveRead<L> {
    #[inline]
    pub(crate) fn tls(&self) -> &L {
        // SAFETY: this thread holds the gate for as long as `self` lives.
        unsafe { &*self.slot.tls.get() }
    }

    #[inline]
    pub(crate) fn tls_mut(&mut self) -> &mut L {
        // SAFETY: this thread holds the gate, and `&mut self` rules out
        // another live borrow through this read.
        unsafe { &mut *self.slot.tls.get() }
    }
}

impl<L> Drop for ActiveRead<L> {
    fn drop(&mut self) {
        self.reading.set(false);
        // `begin` locked the gate on this thread; `ActiveRead` is `!Send`
        // through its `Rc`, so it is unlocked on the same thread.
        self.slot.end_read();
    }
}

/// Enters a read on `registry` from the calling thread, registering a slot
/// on the thread's first read.
pub(crate) fn begin<L>(registry: &Arc<ReaderRegistry<L>>) -> AcquisitionResult<ActiveRead<L>>
where
    L: Default + Send + 'static,
{
    let store_id = registry.store_id;

    let (slot, reading) = match local_lookup::<L>(store_id)? {
        Some(found) => found,
        None => register(registry)?,
    };

    if reading.get() {
        tracing::warn!(store = %registry.name, store_id = %store_id, "reentrant read rejected");
        return Err(AcquisitionError::ReentrantRead {
            store_id: store_id.get(),
        });
    }

    slot.begin_read();
    reading.set(true);
    Ok(ActiveRead { slot, reading })
}

/// Returns true if the calling thread is inside a read of `store_id`.
pub(crate) fn is_reading(store_id: StoreId) -> bool {
    LOCAL_SLOTS
        .try_with(|cell| {
            cell.try_borrow()
                .ok()
                .and_then(|slots| slots.find(store_id).map(|e| e.reading.get()))
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

type SlotPair<L> = (Arc<ReaderSlot<L>>, Rc<Cell<bool>>);

fn local_lookup<L>(store_id: StoreId) -> AcquisitionResult<Option<SlotPair<L>>>
where
    L: Send + 'static,
{
    let (found, stale) = LOCAL_SLOTS
        .try_with(|cell| {
            let mut slots = cell.borrow_mut();
            let stale = slots.take_dropped();
            let found = slots
                .find(store_id)
                .map(|e| (Arc::clone(&e.slot), Rc::clone(&e.reading)));
            (found, stale)
        })
        .map_err(|_| AcquisitionError::ThreadExiting)?;
    // Outside the borrow: dropping `L` runs user code.
    drop(stale);

    let Some((slot, reading)) = found else {
        return Ok(None);
    };

    match slot.downcast::<ReaderSlot<L>>() {
        Ok(slot) => Ok(Some((slot, reading))),
        // Ids are never reused, so the entry belongs to something else
        // entirely; register a fresh slot in its place.
        Err(_) => Ok(None),
    }
}

fn register<L>(registry: &Arc<ReaderRegistry<L>>) -> AcquisitionResult<SlotPair<L>>
where
    L: Default + Send + 'static,
{
    let store_id = registry.store_id;

    // Drop stale entries outside the borrow: releasing them can run user
    // `Drop` code for `L`.
    let stale = LOCAL_SLOTS
        .try_with(|cell| cell.borrow_mut().take_stale(Some(store_id)))
        .map_err(|_| AcquisitionError::ThreadExiting)?;
    drop(stale);

    let slot = Arc::new(ReaderSlot::new(L::default()));
    let handle = registry.register(Arc::clone(&slot))?;
    let reading = Rc::new(Cell::new(false));

    let weak: Weak<ReaderRegistry<L>> = Arc::downgrade(registry);
    let owner: Weak<dyn SlotOwner> = weak;
    let entry = LocalEntry {
        store_id,
        slot: Arc::clone(&slot) as Arc<dyn Any + Send + Sync>,
        owner,
        handle,
        reading: Rc::clone(&reading),
    };

    if let Err(entry) = push_local(entry) {
        // Dropping the entry gives the slot back.
        drop(entry);
        return Err(AcquisitionError::ThreadExiting);
    }

    tracing::debug!(
        store = %registry.name,
        store_id = %store_id,
        slot = handle.index(),
        thread = ?std::thread::current().id(),
        "reader thread registered"
    );

    Ok((slot, reading))
}

fn push_local(entry: LocalEntry) -> Result<(), LocalEntry> {
    let mut pending = Some(entry);
    let _ = LOCAL_SLOTS.try_with(|cell| {
        if let Some(entry) = pending.take() {
            cell.borrow_mut().entries.push(entry);
        }
    });
    pending.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(capacity: usize) -> Arc<ReaderRegistry<u32>> {
        Arc::new(ReaderRegistry::new(
            StoreId::next(),
            String::from("test"),
            capacity,
        ))
    }

    #[test]
    fn test_store_ids_unique() {
        let a = StoreId::next();
        let b = StoreId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }

    #[test]
    fn test_first_read_registers_once() {
        let reg = registry(4);
        assert_eq!(reg.len(), 0);

        drop(begin(&reg).unwrap());
        drop(begin(&reg).unwrap());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_reentrant_read_rejected() {
        let reg = registry(4);
        let active = begin(&reg).unwrap();
        assert!(is_reading(reg.store_id));

        let err = begin(&reg).err().unwrap();
        assert_eq!(
            err,
            AcquisitionError::ReentrantRead {
                store_id: reg.store_id.get()
            }
        );

        drop(active);
        assert!(!is_reading(reg.store_id));
        assert!(begin(&reg).is_ok());
    }

    #[test]
    fn test_tls_persists_between_reads() {
        let reg = registry(4);
        {
            let mut active = begin(&reg).unwrap();
            *active.tls_mut() += 7;
        }
        let active = begin(&reg).unwrap();
        assert_eq!(*active.tls(), 7);
    }

    #[test]
    fn test_thread_exit_releases_slot() {
        let reg = registry(1);
        let remote = Arc::clone(&reg);
        std::thread::spawn(move || {
            drop(begin(&remote).unwrap());
        })
        .join()
        .unwrap();

        assert_eq!(reg.len(), 0);
        // The single slot is reused rather than grown
        assert!(begin(&reg).is_ok());
        assert_eq!(reg.slots.lock().capacity(), 1);
    }

    #[test]
    fn test_registry_grows_past_initial_capacity() {
        let reg = registry(1);
        let remote = Arc::clone(&reg);
        let (hold_tx, hold_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();

        let holder = std::thread::spawn(move || {
            drop(begin(&remote).unwrap());
            ready_tx.send(()).unwrap();
            hold_rx.recv().unwrap();
        });

        ready_rx.recv().unwrap();
        // The only reserved slot is taken by a live thread
        assert!(begin(&reg).is_ok());
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.slots.lock().capacity(), 2);

        hold_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_dropped_store_entry_pruned_on_next_read() {
        static DROPPED: AtomicUsize = AtomicUsize::new(0);

        #[derive(Default)]
        struct Tracked;

        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Ordering::SeqCst);
            }
        }

        let tracked = |name: &str| {
            Arc::new(ReaderRegistry::<Tracked>::new(
                StoreId::next(),
                String::from(name),
                1,
            ))
        };
        let gone = tracked("gone");
        let kept = tracked("kept");

        drop(begin(&gone).unwrap());
        drop(begin(&kept).unwrap());

        // This thread's entry still holds the dropped store's data
        drop(gone);
        assert_eq!(DROPPED.load(Ordering::SeqCst), 0);

        // A read of an already registered store prunes it
        drop(begin(&kept).unwrap());
        assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detach_all_then_thread_exit() {
        let reg = registry(2);
        let remote = Arc::clone(&reg);
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();

        let reader = std::thread::spawn(move || {
            drop(begin(&remote).unwrap());
            drop(remote);
            ready_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            // Thread-local entry drops here, after the registry is gone.
        });

        ready_rx.recv().unwrap();
        assert_eq!(reg.detach_all(), 1);
        drop(reg);

        go_tx.send(()).unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn test_sweep_waits_for_active_read() {
        use std::sync::atomic::AtomicBool;
        use std::time::Duration;

        let reg = registry(2);
        let remote = Arc::clone(&reg);
        let released = Arc::new(AtomicBool::new(false));
        let released_remote = Arc::clone(&released);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();

        let reader = std::thread::spawn(move || {
            let active = begin(&remote).unwrap();
            ready_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            released_remote.store(true, Ordering::SeqCst);
            drop(active);
        });

        ready_rx.recv().unwrap();
        assert_eq!(reg.wait_readers_done(), 1);
        assert!(released.load(Ordering::SeqCst));
        reader.join().unwrap();
    }
}
