//! Level-tagged mutex.
//!
//! Every lock in the server belongs to a [`LockLevel`]. A thread may only
//! acquire a lock whose level is strictly greater than the highest level it
//! already holds, which rules out cycles in the wait-for graph. Debug builds
//! panic on a violation; release builds only keep the bookkeeping.
//!
//! Guards must be released in the reverse order of acquisition, which is what
//! scoped guards do naturally.

use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Position of a lock class in the acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    /// Map of every open connection.
    AllSockets = 1,
    /// Connections armed in the multiplexer or inside the Read stage.
    ReadRegistered = 2,
    /// Connections inside the Parse-and-Run stage.
    Processing = 3,
    /// Connections inside the Write stage.
    WritePending = 4,
    /// One store partition. Always a leaf.
    Shard = 5,
}

thread_local! {
    static HELD: Cell<u8> = const { Cell::new(0) };
}

/// Returns the highest lock level held by the current thread, if any.
pub fn held_level() -> Option<LockLevel> {
    match HELD.with(Cell::get) {
        1 => Some(LockLevel::AllSockets),
        2 => Some(LockLevel::ReadRegistered),
        3 => Some(LockLevel::Processing),
        4 => Some(LockLevel::WritePending),
        5 => Some(LockLevel::Shard),
        _ => None,
    }
}

/// A `parking_lot::Mutex` that checks the lock hierarchy on every acquisition.
pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    /// Acquires the lock.
    ///
    /// # Panics
    ///
    /// In debug builds, if the current thread already holds a lock at this
    /// level or above.
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        let previous = HELD.with(Cell::get);
        debug_assert!(
            previous < self.level as u8,
            "lock order violation: acquiring {:?} while holding {:?}",
            self.level,
            held_level()
        );

        let guard = self.inner.lock();
        HELD.with(|held| held.set(self.level as u8));
        OrderedGuard { guard, previous }
    }
}

impl<T: Default> OrderedMutex<T> {
    pub fn with_level(level: LockLevel) -> Self {
        Self::new(level, T::default())
    }
}

impl<T> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("level", &self.level)
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}

/// RAII guard returned by [`OrderedMutex::lock`].
pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    previous: u8,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        HELD.with(|held| held.set(self.previous));
    }
}
