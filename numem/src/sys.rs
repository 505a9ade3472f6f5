use crate::error::Result;
use crate::node::{CpuMask, NodeId, Placement, num_cpus};

/// Topology, memory policy and affinity of the host.
///
/// Implementations without genuine NUMA control report a single node 0 and
/// turn every policy or binding request into a successful no-op.
pub trait NumaSystem: Send + Sync {
    fn is_available(&self) -> bool;

    fn node_count(&self) -> u32;

    /// Total bytes of memory on `node`.
    fn node_total_bytes(&self, node: NodeId) -> u64;

    /// Free bytes of memory on `node`.
    fn node_free_bytes(&self, node: NodeId) -> u64;

    /// Relative access cost between two nodes, a multiple of 10.
    /// `distance(n, n)` is 10.
    fn distance(&self, a: NodeId, b: NodeId) -> u32;

    /// Node of the CPU the calling thread runs on.
    fn current_node(&self) -> NodeId;

    fn current_cpu(&self) -> usize {
        0
    }

    fn preferred_node(&self) -> NodeId;

    /// Prefer allocations on `node`. A negative node resets the preference.
    fn set_preferred_node(&self, node: NodeId) -> Result<()>;

    /// Allocate on the node of the CPU that touches the page first.
    fn set_local_policy(&self) -> Result<()>;

    /// Run the calling thread only on CPUs of `node`. A negative node allows
    /// every node again.
    fn bind_thread(&self, node: NodeId) -> Result<()>;

    /// Move the pages covering `address..address + len` to `node`.
    ///
    /// ## Safety
    /// The range must be mapped memory owned by the caller.
    unsafe fn copy_range_to_node(&self, address: u64, len: u64, node: NodeId) -> Result<()>;

    /// Move the pages backing `buf` to `node`. Pages are only moved when they
    /// have not been touched yet or when the kernel is allowed to migrate.
    fn copy_to_node(&self, buf: &[u8], node: NodeId) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        unsafe { self.copy_range_to_node(buf.as_ptr().addr() as u64, buf.len() as u64, node) }
    }

    fn affinity(&self) -> Result<CpuMask> {
        Ok(CpuMask::full(num_cpus()))
    }

    fn set_affinity(&self, _mask: &CpuMask) -> Result<()> {
        Ok(())
    }
}

/// Unmanaged memory primitives.
pub trait RawMemory: NumaSystem {
    /// Maps `size` bytes placed according to `placement` and returns the
    /// start address. `size` is never 0.
    fn allocate(&self, size: u64, placement: Placement) -> Result<u64>;

    /// ## Safety
    /// `address` and `size` must come from one successful [`allocate`] call
    /// that has not been freed yet.
    ///
    /// [`allocate`]: RawMemory::allocate
    unsafe fn free(&self, address: u64, size: u64) -> Result<()>;
}
