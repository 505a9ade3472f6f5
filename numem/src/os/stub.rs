use std::alloc::{self, Layout};

use crate::error::{Error, Result};
use crate::node::{NodeId, Placement};
use crate::sys::{NumaSystem, RawMemory};

const BLOCK_ALIGN: usize = memory_addr::PAGE_SIZE_4K;

/// Single-node fallback used where the kernel offers no NUMA control.
///
/// Every node argument is treated as node 0 and memory comes from the global
/// allocator, page aligned.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNuma;

impl NoNuma {
    #[inline]
    pub const fn new() -> Self {
        Self
    }

    #[inline]
    fn layout(size: u64) -> Option<Layout> {
        let size = usize::try_from(size).ok()?;
        Layout::from_size_align(size, BLOCK_ALIGN).ok()
    }
}

impl NumaSystem for NoNuma {
    fn is_available(&self) -> bool {
        false
    }

    fn node_count(&self) -> u32 {
        1
    }

    fn node_total_bytes(&self, _node: NodeId) -> u64 {
        machine::total_bytes()
    }

    fn node_free_bytes(&self, _node: NodeId) -> u64 {
        machine::free_bytes()
    }

    fn distance(&self, _a: NodeId, _b: NodeId) -> u32 {
        crate::LOCAL_DISTANCE
    }

    fn current_node(&self) -> NodeId {
        0
    }

    fn preferred_node(&self) -> NodeId {
        0
    }

    fn set_preferred_node(&self, _node: NodeId) -> Result<()> {
        Ok(())
    }

    fn set_local_policy(&self) -> Result<()> {
        Ok(())
    }

    fn bind_thread(&self, _node: NodeId) -> Result<()> {
        Ok(())
    }

    unsafe fn copy_range_to_node(&self, _address: u64, _len: u64, _node: NodeId) -> Result<()> {
        Ok(())
    }
}

impl RawMemory for NoNuma {
    fn allocate(&self, size: u64, placement: Placement) -> Result<u64> {
        let failure = Error::AllocationFailure {
            requested: size,
            node: placement.node().unwrap_or(0),
        };
        let Some(layout) = Self::layout(size).filter(|l| l.size() != 0) else {
            return Err(failure);
        };
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(failure);
        }
        Ok(ptr.addr() as u64)
    }

    unsafe fn free(&self, address: u64, size: u64) -> Result<()> {
        if address == 0 {
            return Ok(());
        }
        // No allocation can have this size, so nothing was handed out here.
        let Some(layout) = Self::layout(size) else {
            return Err(Error::AllocationFailure {
                requested: size,
                node: 0,
            });
        };
        unsafe { alloc::dealloc(address as usize as *mut u8, layout) };
        Ok(())
    }
}

#[cfg(all(target_os = "linux", feature = "unix"))]
mod machine {
    use nix::unistd::{SysconfVar, sysconf};

    fn pages(var: SysconfVar) -> Option<u64> {
        let pages = sysconf(var).ok()??;
        let page = sysconf(SysconfVar::PAGE_SIZE).ok()??;
        u64::try_from(pages)
            .ok()?
            .checked_mul(u64::try_from(page).ok()?)
    }

    pub(super) fn total_bytes() -> u64 {
        pages(SysconfVar::_PHYS_PAGES).unwrap_or(0)
    }

    pub(super) fn free_bytes() -> u64 {
        pages(SysconfVar::_AVPHYS_PAGES).unwrap_or(0)
    }
}

#[cfg(not(all(target_os = "linux", feature = "unix")))]
mod machine {
    pub(super) fn total_bytes() -> u64 {
        0
    }

    pub(super) fn free_bytes() -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::NoNuma;
    use crate::error::Error;
    use crate::node::{NO_NODE, Placement};
    use crate::sys::{NumaSystem, RawMemory};

    #[test]
    fn single_node() {
        let numa = NoNuma::new();
        assert!(!numa.is_available());
        assert_eq!(numa.node_count(), 1);
        assert_eq!(numa.distance(0, 0), 10);
        assert_eq!(numa.distance(0, 3), 10);
        assert_eq!(numa.current_node(), 0);
        assert_eq!(numa.preferred_node(), 0);
        assert!(numa.node_free_bytes(0) <= numa.node_total_bytes(0));
    }

    #[test]
    fn policies_are_noops() {
        let numa = NoNuma::new();
        numa.bind_thread(0).unwrap();
        numa.bind_thread(5).unwrap();
        numa.bind_thread(NO_NODE).unwrap();
        numa.set_preferred_node(2).unwrap();
        numa.set_preferred_node(NO_NODE).unwrap();
        numa.set_local_policy().unwrap();
        numa.copy_to_node(&[1, 2, 3], 1).unwrap();
        numa.set_affinity(&numa.affinity().unwrap()).unwrap();
    }

    #[test]
    fn alloc_free() {
        let numa = NoNuma::new();
        for placement in [
            Placement::Default,
            Placement::Local,
            Placement::Interleaved,
            Placement::OnNode(3),
        ] {
            let addr = numa.allocate(8192, placement).unwrap();
            assert_ne!(addr, 0);
            assert_eq!(addr % 4096, 0);
            unsafe {
                let ptr = addr as usize as *mut u8;
                assert_eq!(*ptr, 0);
                ptr.write(7);
                assert_eq!(*ptr, 7);
                numa.free(addr, 8192).unwrap();
            }
        }
    }

    #[test]
    fn oversized_fails() {
        let numa = NoNuma::new();
        assert!(numa.allocate(u64::MAX, Placement::OnNode(0)).is_err());
    }

    #[test]
    fn impossible_size_is_not_freed() {
        let numa = NoNuma::new();
        assert_eq!(
            unsafe { numa.free(0x1000, u64::MAX) }.unwrap_err(),
            Error::AllocationFailure {
                requested: u64::MAX,
                node: 0
            }
        );
        unsafe { numa.free(0, u64::MAX).unwrap() };
    }
}
