use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;
use crossbeam_utils::Backoff;

use crate::error::{Error, Result};

use crate::handle::MemoryHandle;
use crate::node::NodeId;

/// Allocation ids start at 1 and are never reused within a process, so a
/// stale tracker can't be confused with a later block at the same address.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Non-owning shadow of one live allocation.
///
/// The registry keeps one per allocation. It observes the owning [`Memory`]
/// guard without keeping it alive, and a copy is handed to the collector once
/// the last guard is gone.
///
/// [`Memory`]: crate::Memory
#[derive(Clone)]
pub struct WeakTracker {
    handle: MemoryHandle,
    target: Weak<Tracked>,
}

impl WeakTracker {
    pub(crate) fn observe(tracked: &Arc<Tracked>) -> Self {
        Self {
            handle: tracked.handle,
            target: Arc::downgrade(tracked),
        }
    }

    /// A tracker whose target is already gone.
    pub(crate) fn detached(handle: MemoryHandle) -> Self {
        Self {
            handle,
            target: Weak::new(),
        }
    }

    /// Rebuilds the handle this tracker was captured from.
    #[inline]
    pub fn handle(&self) -> MemoryHandle {
        self.handle
    }

    #[inline]
    pub fn address(&self) -> u64 {
        self.handle.address()
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.handle.size()
    }

    #[inline]
    pub fn node(&self) -> NodeId {
        self.handle.node()
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Whether every owning guard has been dropped.
    #[inline]
    pub fn is_detached(&self) -> bool {
        self.target.strong_count() == 0
    }

    /// Marks the observed guard as released so later accesses through it
    /// fail, and waits for accesses already in flight.
    pub(crate) fn invalidate(&self) {
        if let Some(t) = self.target.upgrade() {
            t.seal();
        }
    }
}

impl core::fmt::Debug for WeakTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WeakTracker")
            .field("handle", &self.handle)
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// A tracker on its way to the collector.
///
/// If it is dropped before being handled, because the collector stopped or
/// the channel went away with it still queued, it reclaims on the spot.
pub(crate) struct Pending {
    tracker: WeakTracker,
    owner: Option<Arc<dyn Reclaim>>,
}

impl Pending {
    pub(crate) fn new(tracker: WeakTracker, owner: Arc<dyn Reclaim>) -> Self {
        Self {
            tracker,
            owner: Some(owner),
        }
    }

    #[inline]
    pub(crate) fn tracker(&self) -> &WeakTracker {
        &self.tracker
    }

    pub(crate) fn reclaim(mut self) -> bool {
        self.owner
            .take()
            .is_some_and(|owner| owner.reclaim(&self.tracker))
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.reclaim(&self.tracker);
        }
    }
}

/// Messages understood by the collector.
pub(crate) enum Notice {
    /// The last guard of an allocation was dropped.
    Collected(Pending),
    /// Acknowledge once everything queued before has been handled.
    Flush(Sender<()>),
    /// Drain what is queued, then stop.
    Shutdown,
}

impl core::fmt::Debug for Notice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Collected(p) => f.debug_tuple("Collected").field(p.tracker()).finish(),
            Self::Flush(_) => write!(f, "Flush"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// The release path shared by explicit release, the collector and guards.
pub(crate) trait Reclaim: Send + Sync {
    /// Releases the allocation `tracker` stands for, unless it is no longer
    /// registered under the same id. Returns whether this call freed it.
    fn reclaim(&self, tracker: &WeakTracker) -> bool;
}

const RELEASED: u64 = 1 << 63;

/// State behind a [`Memory`] guard.
///
/// `state` packs a released bit with the number of accesses in flight. Once
/// the bit is set no new access starts, and the block is only freed after the
/// count drops to zero.
///
/// [`Memory`]: crate::Memory
pub(crate) struct Tracked {
    handle: MemoryHandle,
    state: AtomicU64,
    notify: Option<Sender<Notice>>,
    owner: Arc<dyn Reclaim>,
}

impl Tracked {
    pub(crate) fn new(
        handle: MemoryHandle,
        notify: Option<Sender<Notice>>,
        owner: Arc<dyn Reclaim>,
    ) -> Self {
        Self {
            handle,
            state: AtomicU64::new(0),
            notify,
            owner,
        }
    }

    #[inline]
    pub(crate) fn handle(&self) -> MemoryHandle {
        self.handle
    }

    #[inline]
    pub(crate) fn is_released(&self) -> bool {
        self.state.load(Ordering::Acquire) & RELEASED != 0
    }

    /// Starts an access to the block, failing once it has been released.
    pub(crate) fn enter(&self) -> Result<Access<'_>> {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur & RELEASED != 0 {
                return Err(Error::Released);
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(Access(self)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Sets the released bit and waits until no access is in flight.
    /// Returns `false` if it was already set.
    pub(crate) fn seal(&self) -> bool {
        let prev = self.state.fetch_or(RELEASED, Ordering::AcqRel);
        if prev & RELEASED != 0 {
            return false;
        }
        let backoff = Backoff::new();
        while self.state.load(Ordering::Acquire) & !RELEASED != 0 {
            backoff.snooze();
        }
        true
    }

    /// Explicit release through the guard itself.
    pub(crate) fn release(&self) -> bool {
        if !self.seal() {
            return false;
        }
        self.owner
            .reclaim(&WeakTracker::detached(self.handle))
    }
}

/// An access in flight, keeps the block from being freed.
pub(crate) struct Access<'a>(&'a Tracked);

impl Access<'_> {
    #[inline]
    pub(crate) fn ptr(&self) -> *mut u8 {
        self.0.handle.as_ptr()
    }
}

impl Drop for Access<'_> {
    fn drop(&mut self) {
        self.0.state.fetch_sub(1, Ordering::Release);
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }
        let pending = Pending::new(
            WeakTracker::detached(self.handle),
            self.owner.clone(),
        );
        match self.notify.take() {
            // A refused notice is dropped right here and reclaims inline.
            Some(tx) => {
                let _ = tx.send(Notice::Collected(pending));
            }
            None => {
                pending.reclaim();
            }
        }
    }
}
