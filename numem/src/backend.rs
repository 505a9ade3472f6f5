#[cfg(all(target_os = "linux", feature = "unix"))]
use crate::os::LinuxNuma;
use crate::error::Result;
use crate::node::{CpuMask, NodeId, Placement};
use crate::os::NoNuma;
use crate::sys::{NumaSystem, RawMemory};

/// The NUMA implementation picked once at start-up.
#[derive(Debug, Clone)]
pub enum Backend {
    #[cfg(all(target_os = "linux", feature = "unix"))]
    Real(LinuxNuma),
    Stub(NoNuma),
}

impl Backend {
    /// Uses the kernel's NUMA support when present, the single-node stub
    /// otherwise.
    pub fn probe() -> Self {
        #[cfg(all(target_os = "linux", feature = "unix"))]
        {
            if let Some(numa) = LinuxNuma::probe() {
                log!(debug, "numa available, {} nodes", numa.node_count());
                return Self::Real(numa);
            }
        }

        log!(debug, "numa unavailable, falling back to a single node");
        Self::Stub(NoNuma)
    }

    #[inline]
    pub const fn stub() -> Self {
        Self::Stub(NoNuma)
    }

    /// Honours `NUMEM_BACKEND=stub`, probes otherwise.
    pub fn from_env() -> Self {
        match std::env::var("NUMEM_BACKEND").as_deref() {
            Ok("stub") => Self::stub(),
            _ => Self::probe(),
        }
    }

    #[inline]
    pub const fn is_stub(&self) -> bool {
        matches!(self, Self::Stub(_))
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::probe()
    }
}

macro_rules! dispatch {
    ($self:ident, $bk:ident => $call:expr) => {
        match $self {
            #[cfg(all(target_os = "linux", feature = "unix"))]
            Backend::Real($bk) => $call,
            Backend::Stub($bk) => $call,
        }
    };
}

impl NumaSystem for Backend {
    fn is_available(&self) -> bool {
        dispatch!(self, bk => bk.is_available())
    }

    fn node_count(&self) -> u32 {
        dispatch!(self, bk => bk.node_count())
    }

    fn node_total_bytes(&self, node: NodeId) -> u64 {
        dispatch!(self, bk => bk.node_total_bytes(node))
    }

    fn node_free_bytes(&self, node: NodeId) -> u64 {
        dispatch!(self, bk => bk.node_free_bytes(node))
    }

    fn distance(&self, a: NodeId, b: NodeId) -> u32 {
        dispatch!(self, bk => bk.distance(a, b))
    }

    fn current_node(&self) -> NodeId {
        dispatch!(self, bk => bk.current_node())
    }

    fn current_cpu(&self) -> usize {
        dispatch!(self, bk => bk.current_cpu())
    }

    fn preferred_node(&self) -> NodeId {
        dispatch!(self, bk => bk.preferred_node())
    }

    fn set_preferred_node(&self, node: NodeId) -> Result<()> {
        dispatch!(self, bk => bk.set_preferred_node(node))
    }

    fn set_local_policy(&self) -> Result<()> {
        dispatch!(self, bk => bk.set_local_policy())
    }

    fn bind_thread(&self, node: NodeId) -> Result<()> {
        dispatch!(self, bk => bk.bind_thread(node))
    }

    unsafe fn copy_range_to_node(&self, address: u64, len: u64, node: NodeId) -> Result<()> {
        dispatch!(self, bk => unsafe { bk.copy_range_to_node(address, len, node) })
    }

    fn affinity(&self) -> Result<CpuMask> {
        dispatch!(self, bk => bk.affinity())
    }

    fn set_affinity(&self, mask: &CpuMask) -> Result<()> {
        dispatch!(self, bk => bk.set_affinity(mask))
    }
}

impl RawMemory for Backend {
    fn allocate(&self, size: u64, placement: Placement) -> Result<u64> {
        dispatch!(self, bk => bk.allocate(size, placement))
    }

    unsafe fn free(&self, address: u64, size: u64) -> Result<()> {
        dispatch!(self, bk => unsafe { bk.free(address, size) })
    }
}

#[cfg(test)]
mod tests {
    use super::Backend;
    use crate::node::NO_NODE;
    use crate::sys::NumaSystem;

    #[test]
    fn stub_degrades() {
        let bk = Backend::stub();
        assert!(bk.is_stub());
        assert!(!bk.is_available());
        assert_eq!(bk.node_count(), 1);
        assert_eq!(bk.distance(0, 0), 10);
        bk.bind_thread(0).unwrap();
        bk.bind_thread(NO_NODE).unwrap();
    }

    #[test]
    fn probe_is_consistent() {
        let bk = Backend::probe();
        assert_eq!(bk.is_stub(), !bk.is_available());
        assert!(bk.node_count() >= 1);
        let node = bk.current_node();
        assert!(node >= 0 && (node as u32) < bk.node_count());
    }
}
