use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::backend::Backend;
use crate::collector::{self, Collector};
use crate::error::{Error, Result};
use crate::handle::MemoryHandle;
use crate::memory::Memory;
use crate::node::{NodeId, Placement};
use crate::sys::RawMemory;
use crate::tracker::{self, Notice, Reclaim, Tracked, WeakTracker};

/// How blocks whose guards were dropped get back to the system.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Reclamation {
    /// Hand them to a collector thread owned by the registry.
    #[default]
    Deferred,
    /// Free them on the thread dropping the last guard. No thread is started.
    Inline,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub reclamation: Reclamation,
    /// Name of the collector thread.
    pub collector_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reclamation: Reclamation::Deferred,
            collector_name: "numem-collector".to_owned(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    config: RegistryConfig,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reclamation(mut self, reclamation: Reclamation) -> Self {
        self.config.reclamation = reclamation;
        self
    }

    pub fn collector_name(mut self, name: impl Into<String>) -> Self {
        self.config.collector_name = name.into();
        self
    }

    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build<B: RawMemory + 'static>(self, backend: B) -> AllocationRegistry<B> {
        AllocationRegistry::with_config(backend, self.config)
    }
}

/// State reachable from the registry, its collector and every live guard.
struct Shared<B> {
    backend: B,
    table: spin::Mutex<HashMap<u64, WeakTracker>>,
    counters: Box<[CachePadded<AtomicU64>]>,
}

impl<B: RawMemory> Shared<B> {
    fn new(backend: B) -> Self {
        let nodes = backend.node_count().max(1) as usize;
        Self {
            backend,
            table: spin::Mutex::new(HashMap::new()),
            counters: (0..nodes).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
        }
    }

    #[inline]
    fn counter(&self, node: NodeId) -> Option<&AtomicU64> {
        let node = usize::try_from(node).ok()?;
        self.counters.get(node).map(|c| &**c)
    }

    fn register(&self, tracker: WeakTracker) {
        let mut table = self.table.lock();
        if let Some(c) = self.counter(tracker.node()) {
            c.fetch_add(tracker.size(), Ordering::AcqRel);
        }
        if let Some(stale) = table.insert(tracker.address(), tracker) {
            log!(error, "address {:#x} registered twice", stale.address());
            if let Some(c) = self.counter(stale.node()) {
                c.fetch_sub(stale.size(), Ordering::AcqRel);
            }
        }
    }

    /// Removes the entry at `address` if `accept` agrees. Whoever gets the
    /// entry back owns the free.
    fn unregister(
        &self,
        address: u64,
        accept: impl FnOnce(&WeakTracker) -> bool,
    ) -> Option<WeakTracker> {
        let mut table = self.table.lock();
        if !table.get(&address).is_some_and(accept) {
            return None;
        }
        let entry = table.remove(&address)?;
        if let Some(c) = self.counter(entry.node()) {
            c.fetch_sub(entry.size(), Ordering::AcqRel);
        }
        Some(entry)
    }

    fn free(&self, handle: MemoryHandle) {
        log!(debug, "release {:?}", handle);
        if let Err(err) = unsafe { self.backend.free(handle.address(), handle.size()) } {
            log!(warn, "failed to free {:?}: {}", handle, err);
        }
    }
}

impl<B: RawMemory> Reclaim for Shared<B> {
    fn reclaim(&self, tracker: &WeakTracker) -> bool {
        match self.unregister(tracker.address(), |e| e.id() == tracker.id()) {
            Some(entry) => {
                self.free(entry.handle());
                true
            }
            None => false,
        }
    }
}

/// Hands out NUMA placed blocks and keeps track of them until release.
///
/// Every outstanding block has exactly one entry, keyed by address, and is
/// counted once in the byte counter of the node it was attributed to.
/// A block is freed by whichever path removes its entry first: an explicit
/// [`release`], [`Memory::release`], or reclamation after its guard dropped.
///
/// [`release`]: AllocationRegistry::release
pub struct AllocationRegistry<B: RawMemory + 'static = Backend> {
    shared: Arc<Shared<B>>,
    collector: spin::Mutex<Option<Collector>>,
    shut_down: AtomicBool,
    config: RegistryConfig,
}

impl AllocationRegistry<Backend> {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }
}

impl<B: RawMemory + 'static> AllocationRegistry<B> {
    /// A registry with the default configuration.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, RegistryConfig::default())
    }

    pub fn with_config(backend: B, config: RegistryConfig) -> Self {
        let collector = match config.reclamation {
            Reclamation::Inline => None,
            Reclamation::Deferred => match Collector::spawn(&config.collector_name) {
                Ok(c) => Some(c),
                Err(err) => {
                    log!(warn, "cannot start collector, reclaiming inline: {}", err);
                    None
                }
            },
        };
        Self {
            shared: Arc::new(Shared::new(backend)),
            collector: spin::Mutex::new(collector),
            shut_down: AtomicBool::new(false),
            config,
        }
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    #[inline]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Node a block placed by `placement` is attributed to.
    fn resolve(&self, placement: Placement) -> Result<NodeId> {
        let backend = &self.shared.backend;
        let nodes = backend.node_count();
        let within = |n: NodeId| n >= 0 && (n as u32) < nodes;
        match placement.node() {
            _ if !backend.is_available() => Ok(0),
            Some(n) if within(n) => Ok(n),
            Some(node) => Err(Error::InvalidNode { node, nodes }),
            None => Ok(Some(backend.current_node()).filter(|n| within(*n)).unwrap_or(0)),
        }
    }

    fn notifier(&self) -> Option<crossbeam_channel::Sender<Notice>> {
        self.collector.lock().as_ref().map(Collector::sender)
    }

    /// Allocates `capacity` bytes placed according to `placement`. A plain
    /// node id binds to that node, a negative one means the current node.
    ///
    /// A zero `capacity` yields the empty guard without touching the system.
    pub fn allocate(&self, capacity: u64, placement: impl Into<Placement>) -> Result<Memory> {
        let placement = placement.into();
        if capacity == 0 {
            return Ok(Memory::empty());
        }
        let node = self.resolve(placement)?;
        let placement = match placement {
            Placement::Current => Placement::OnNode(node),
            p => p,
        };
        let address = self.shared.backend.allocate(capacity, placement)?;
        if address == 0 {
            return Err(Error::AllocationFailure {
                requested: capacity,
                node,
            });
        }

        let handle = MemoryHandle::with_id(address, capacity, node, tracker::next_id());
        let owner: Arc<dyn Reclaim> = self.shared.clone();
        let tracked = Arc::new(Tracked::new(handle, self.notifier(), owner));
        self.shared.register(WeakTracker::observe(&tracked));
        log!(debug, "allocate {:?} ({})", handle, placement);
        Ok(Memory::tracked(tracked))
    }

    #[inline]
    pub fn allocate_on(&self, capacity: u64, node: NodeId) -> Result<Memory> {
        self.allocate(capacity, Placement::OnNode(node))
    }

    #[inline]
    pub fn allocate_current(&self, capacity: u64) -> Result<Memory> {
        self.allocate(capacity, Placement::Current)
    }

    /// Placed by the thread's local policy, attributed to its current node.
    #[inline]
    pub fn allocate_local(&self, capacity: u64) -> Result<Memory> {
        self.allocate(capacity, Placement::Local)
    }

    /// Interleaved over every node, attributed to the current node.
    #[inline]
    pub fn allocate_interleaved(&self, capacity: u64) -> Result<Memory> {
        self.allocate(capacity, Placement::Interleaved)
    }

    /// Releases the block behind `handle` if it is still registered.
    ///
    /// Empty, unknown or already released handles are ignored, as are racing
    /// releases that lost to another path. A handle only matches the
    /// allocation it was handed out for, not a later block that reused its
    /// address. A guard still holding the block fails on its next access.
    pub fn release(&self, handle: MemoryHandle) {
        if handle.is_empty() {
            return;
        }
        let Some(entry) = self
            .shared
            .unregister(handle.address(), |e| e.handle() == handle)
        else {
            log!(trace, "{:?} is not registered", handle);
            return;
        };
        entry.invalidate();
        self.shared.free(entry.handle());
    }

    /// Bytes outstanding on `node`, 0 for a node outside the topology.
    pub fn allocated_size(&self, node: NodeId) -> u64 {
        self.shared
            .counter(node)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    pub fn live_allocations(&self) -> usize {
        self.shared.table.lock().len()
    }

    pub fn is_tracked(&self, address: u64) -> bool {
        self.shared.table.lock().contains_key(&address)
    }

    /// Allocates without registering. The caller frees with [`free_raw`].
    ///
    /// [`free_raw`]: AllocationRegistry::free_raw
    pub fn allocate_raw(&self, capacity: u64, placement: impl Into<Placement>) -> Result<u64> {
        if capacity == 0 {
            return Ok(0);
        }
        self.shared.backend.allocate(capacity, placement.into())
    }

    /// ## Safety
    /// `address` and `size` must come from [`allocate_raw`] on this registry,
    /// and must not be freed twice.
    ///
    /// [`allocate_raw`]: AllocationRegistry::allocate_raw
    pub unsafe fn free_raw(&self, address: u64, size: u64) -> Result<()> {
        if address == 0 {
            return Ok(());
        }
        unsafe { self.shared.backend.free(address, size) }
    }

    /// Waits until every guard dropped before this call has been reclaimed.
    pub fn quiesce(&self) {
        if let Some(tx) = self.notifier() {
            collector::flush(&tx);
        }
    }

    /// Stops the collector once it has drained what is queued. Guards dropped
    /// afterwards are reclaimed inline. Calling it again does nothing.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let collector = self.collector.lock().take();
        if let Some(c) = collector {
            c.shutdown();
        }
    }

    /// Whether [`shutdown`] has been called, directly or by dropping.
    ///
    /// [`shutdown`]: AllocationRegistry::shutdown
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl<B: RawMemory + 'static> Drop for AllocationRegistry<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<B: RawMemory + 'static> core::fmt::Debug for AllocationRegistry<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AllocationRegistry")
            .field("config", &self.config)
            .field("live", &self.live_allocations())
            .field("counters", &self.shared.counters)
            .finish()
    }
}
