use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::lock_api::{self, GetThreadId, GuardNoSend, RawMutex};

use crate::error::LockMisuse;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_ID: NonZeroUsize =
        NonZeroUsize::new(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)).unwrap_or(NonZeroUsize::MIN);
}

/// Non-zero identity of the calling thread.
fn current_thread_id() -> usize {
    THREAD_ID.with(|id| id.get())
}

/// Optimistic reentrant spin lock.
///
/// The owner word is claimed with a compare-and-swap; the depth counter is only
/// touched by the owning thread. Waiters spin without parking and are not
/// served in any particular order.
#[derive(Default)]
pub struct ReentrantLock {
    owner: AtomicUsize,
    depth: AtomicUsize,
}

impl ReentrantLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    /// Acquire the lock, spinning while another thread holds it.
    pub fn lock(&self) {
        let me = current_thread_id();
        while !self.acquire(me) {
            while self.owner.load(Ordering::Relaxed) != 0 {
                std::hint::spin_loop();
            }
        }
    }

    /// Acquire the lock only if it is free or already held by this thread.
    pub fn try_lock(&self) -> bool {
        self.acquire(current_thread_id())
    }

    fn acquire(&self, me: usize) -> bool {
        if self.owner.load(Ordering::Relaxed) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if self
            .owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.depth.store(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Release one level of ownership; the last release frees the lock.
    pub fn unlock(&self) -> Result<(), LockMisuse> {
        if self.owner.load(Ordering::Relaxed) != current_thread_id() {
            return Err(LockMisuse);
        }
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(0, Ordering::Release);
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_id()
    }

    /// Reentrancy depth as seen by the owner; 0 for any other thread.
    pub fn depth(&self) -> usize {
        if self.is_owned_by_current_thread() {
            self.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }
}

impl fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

// SAFETY: `lock` and `try_lock` admit one thread at a time and `unlock` only
// releases when called by that thread. `ReentrantMutex` takes this lock once
// per outermost guard and releases it from the same thread, since guards are
// `GuardNoSend`.
unsafe impl RawMutex for ReentrantLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        ReentrantLock::lock(self)
    }

    fn try_lock(&self) -> bool {
        ReentrantLock::try_lock(self)
    }

    unsafe fn unlock(&self) {
        let _ = ReentrantLock::unlock(self);
    }

    fn is_locked(&self) -> bool {
        ReentrantLock::is_locked(self)
    }
}

/// Thread identity used by [`ReentrantMutex`] to recognise re-entry.
pub struct ThreadOwner;

// SAFETY: ids come from a process-wide counter and are fixed per thread, so
// two live threads never share one. Zero is never handed out.
unsafe impl GetThreadId for ThreadOwner {
    const INIT: Self = ThreadOwner;

    fn nonzero_thread_id(&self) -> NonZeroUsize {
        THREAD_ID.with(|id| *id)
    }
}

/// Data protected by a [`ReentrantLock`].
///
/// Guards hand out shared references only, since the same thread may hold
/// several at once; wrap the data in a `RefCell` to mutate it.
pub type ReentrantMutex<T> = lock_api::ReentrantMutex<ReentrantLock, ThreadOwner, T>;

/// Held ownership of a [`ReentrantMutex`]; dropping it releases one level.
pub type ReentrantMutexGuard<'a, T> = lock_api::ReentrantMutexGuard<'a, ReentrantLock, ThreadOwner, T>;
