//! A process wide registry for callers that don't manage their own.
//!
//! It is created on first use with [`Backend::from_env`] and lives until the
//! process exits.

use crate::backend::Backend;
use crate::error::Result;
use crate::handle::MemoryHandle;
use crate::memory::Memory;
use crate::node::{NodeId, Placement};
use crate::registry::AllocationRegistry;
use crate::sys::NumaSystem;

static REGISTRY: spin::Once<AllocationRegistry> = spin::Once::new();

pub fn registry() -> &'static AllocationRegistry {
    REGISTRY.call_once(|| AllocationRegistry::new(Backend::from_env()))
}

#[inline]
pub fn backend() -> &'static Backend {
    registry().backend()
}

#[inline]
pub fn allocate(capacity: u64, placement: impl Into<Placement>) -> Result<Memory> {
    registry().allocate(capacity, placement)
}

#[inline]
pub fn allocate_local(capacity: u64) -> Result<Memory> {
    registry().allocate_local(capacity)
}

#[inline]
pub fn allocate_interleaved(capacity: u64) -> Result<Memory> {
    registry().allocate_interleaved(capacity)
}

#[inline]
pub fn release(handle: MemoryHandle) {
    registry().release(handle)
}

#[inline]
pub fn allocated_size(node: NodeId) -> u64 {
    registry().allocated_size(node)
}

#[inline]
pub fn is_available() -> bool {
    backend().is_available()
}

#[inline]
pub fn node_count() -> u32 {
    backend().node_count()
}

#[inline]
pub fn current_node() -> NodeId {
    backend().current_node()
}

#[inline]
pub fn distance(a: NodeId, b: NodeId) -> u32 {
    backend().distance(a, b)
}

#[inline]
pub fn bind_thread(node: NodeId) -> Result<()> {
    backend().bind_thread(node)
}

/// Allocates without any bookkeeping, see [`AllocationRegistry::allocate_raw`].
#[inline]
pub fn allocate_raw(capacity: u64, placement: impl Into<Placement>) -> Result<u64> {
    registry().allocate_raw(capacity, placement)
}

/// ## Safety
/// See [`AllocationRegistry::free_raw`].
#[inline]
pub unsafe fn free_raw(address: u64, size: u64) -> Result<()> {
    unsafe { registry().free_raw(address, size) }
}
