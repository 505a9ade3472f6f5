#![cfg(all(target_os = "linux", feature = "unix"))]

use core::ffi::{c_int, c_long, c_uint, c_ulong, c_void};
use core::num::NonZeroUsize;
use core::ptr::{self, NonNull};
use std::fs;
use std::path::PathBuf;

use nix::sys::mman::{MapFlags, ProtFlags};
use nix::errno::Errno;
use nix::libc;
use nix::sched::{self, CpuSet};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::node::{CpuMask, NodeId, Placement};
use crate::sys::{NumaSystem, RawMemory};

const NODE_ROOT: &str = "/sys/devices/system/node";
const REMOTE_DISTANCE: u32 = 20;
const WORD_BITS: usize = c_ulong::BITS as usize;

/// Memory policy modes understood by `mbind` and `set_mempolicy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
enum Mode {
    Default = 0,
    Preferred = 1,
    Bind = 2,
    Interleave = 3,
    Local = 4,
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MbindFlags: c_uint {
        const STRICT   = 0x1;
        const MOVE     = 0x1 << 1;
        const MOVE_ALL = 0x1 << 2;
    }
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct PolicyQuery: c_ulong {
        const NODE         = 0x1;
        const ADDR         = 0x1 << 1;
        const MEMS_ALLOWED = 0x1 << 2;
    }
}

/// Bitmap of nodes in the layout the kernel expects.
#[derive(Debug, Clone)]
struct NodeMask(Vec<c_ulong>);

impl NodeMask {
    fn empty(nodes: usize) -> Self {
        Self(vec![0; nodes.div_ceil(WORD_BITS).max(1)])
    }

    fn of(nodes: usize, node: usize) -> Self {
        let mut mask = Self::empty(nodes.max(node + 1));
        mask.set(node);
        mask
    }

    fn set(&mut self, node: usize) {
        self.0[node / WORD_BITS] |= 1 << (node % WORD_BITS);
    }

    fn first(&self) -> Option<usize> {
        self.0.iter().enumerate().find_map(|(i, w)| {
            (*w != 0).then(|| i * WORD_BITS + w.trailing_zeros() as usize)
        })
    }

    #[inline]
    fn as_ptr(&self) -> *const c_ulong {
        self.0.as_ptr()
    }

    /// The kernel reads `maxnode - 1` bits.
    #[inline]
    fn maxnode(&self) -> c_ulong {
        (self.0.len() * WORD_BITS + 1) as c_ulong
    }
}

unsafe fn mbind(
    start: usize,
    len: usize,
    mode: Mode,
    mask: Option<&NodeMask>,
    flags: MbindFlags,
) -> Result<()> {
    let (nodes, maxnode) = mask.map_or((ptr::null(), 0), |m| (m.as_ptr(), m.maxnode()));
    let ret = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            start as c_ulong,
            len as c_ulong,
            mode as c_ulong,
            nodes,
            maxnode,
            flags.bits() as c_ulong,
        )
    };
    Errno::result(ret).map(drop).map_err(Error::Os)
}

fn set_mempolicy(mode: Mode, mask: Option<&NodeMask>) -> Result<()> {
    let (nodes, maxnode) = mask.map_or((ptr::null(), 0), |m| (m.as_ptr(), m.maxnode()));
    let ret =
        unsafe { libc::syscall(libc::SYS_set_mempolicy, mode as c_long, nodes, maxnode) };
    Errno::result(ret).map(drop).map_err(Error::Os)
}

fn get_mempolicy(mask: Option<&mut NodeMask>, query: PolicyQuery) -> Result<c_int> {
    let mut mode: c_int = 0;
    let (nodes, maxnode) = mask.map_or((ptr::null_mut(), 0), |m| {
        let maxnode = m.maxnode();
        (m.0.as_mut_ptr(), maxnode)
    });
    let ret = unsafe {
        libc::syscall(
            libc::SYS_get_mempolicy,
            &mut mode as *mut c_int,
            nodes,
            maxnode,
            ptr::null_mut::<c_void>(),
            query.bits(),
        )
    };
    Errno::result(ret).map(|_| mode).map_err(Error::Os)
}

/// Parses the kernel's list format, e.g. `0-3,8,10-11`.
pub fn parse_list(text: &str) -> Option<Vec<usize>> {
    let text = text.trim();
    if text.is_empty() {
        return Some(Vec::new());
    }
    let mut out = Vec::new();
    for part in text.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (lo.trim().parse::<usize>().ok()?, hi.trim().parse().ok()?);
                if hi < lo {
                    return None;
                }
                out.extend(lo..=hi);
            }
            None => out.push(part.trim().parse().ok()?),
        }
    }
    Some(out)
}

/// Reads `key` (e.g. `MemTotal`) from a per-node meminfo file, in bytes.
pub fn parse_meminfo(text: &str, key: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        // Node 0 MemTotal:       16318412 kB
        let (name, value) = line.split_once(':')?;
        if name.split_whitespace().last()? != key {
            return None;
        }
        let mut fields = value.split_whitespace();
        let amount: u64 = fields.next()?.parse().ok()?;
        match fields.next() {
            Some("kB") => amount.checked_mul(1024),
            None => Some(amount),
            Some(_) => None,
        }
    })
}

/// Picks the distance to `to` out of a node's distance row.
pub fn parse_distance(text: &str, to: usize) -> Option<u32> {
    text.split_whitespace().nth(to)?.parse().ok()
}

/// NUMA control through the Linux memory policy system calls and sysfs.
#[derive(Debug, Clone)]
pub struct LinuxNuma {
    nodes: u32,
    online: Vec<usize>,
    page_size: usize,
}

impl LinuxNuma {
    /// Returns `None` when the kernel has no NUMA support.
    pub fn probe() -> Option<Self> {
        get_mempolicy(None, PolicyQuery::empty()).ok()?;

        let online = fs::read_to_string(PathBuf::from(NODE_ROOT).join("online"))
            .ok()
            .and_then(|text| parse_list(&text))
            .filter(|nodes| !nodes.is_empty())?;
        let nodes = online.iter().max().map(|n| *n as u32 + 1)?;
        let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map_or(memory_addr::PAGE_SIZE_4K, |p| p as usize);

        Some(Self {
            nodes,
            online,
            page_size,
        })
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn online_nodes(&self) -> &[usize] {
        &self.online
    }

    fn check(&self, node: NodeId) -> Result<usize> {
        usize::try_from(node)
            .ok()
            .filter(|n| self.online.contains(n))
            .ok_or(Error::InvalidNode {
                node,
                nodes: self.nodes,
            })
    }

    fn node_file(node: usize, name: &str) -> Option<String> {
        let path = PathBuf::from(NODE_ROOT)
            .join(format!("node{}", node))
            .join(name);
        fs::read_to_string(path).ok()
    }

    fn meminfo(&self, node: NodeId, key: &str) -> u64 {
        self.check(node)
            .ok()
            .and_then(|n| Self::node_file(n, "meminfo"))
            .and_then(|text| parse_meminfo(&text, key))
            .unwrap_or(0)
    }

    fn all_nodes(&self) -> NodeMask {
        let mut mask = NodeMask::empty(self.nodes as usize);
        self.online.iter().for_each(|n| mask.set(*n));
        mask
    }

    fn node_cpus(&self, node: usize) -> Result<Vec<usize>> {
        Self::node_file(node, "cpulist")
            .and_then(|text| parse_list(&text))
            .ok_or(Error::InvalidNode {
                node: node as NodeId,
                nodes: self.nodes,
            })
    }

    fn cpu_set<I: IntoIterator<Item = usize>>(cpus: I) -> Result<CpuSet> {
        let mut set = CpuSet::new();
        for cpu in cpus.into_iter().filter(|cpu| *cpu < CpuSet::count()) {
            set.set(cpu)?;
        }
        Ok(set)
    }

    /// Applies `placement` to a fresh mapping.
    unsafe fn place(&self, start: usize, len: usize, placement: Placement) -> Result<NodeId> {
        let (mode, mask, node) = match placement {
            Placement::Default => return Ok(self.current_node()),
            Placement::Local => (Mode::Local, None, self.current_node()),
            Placement::Interleaved => (Mode::Interleave, Some(self.all_nodes()), self.current_node()),
            Placement::Current => {
                let node = self.current_node();
                let n = self.check(node)?;
                (Mode::Bind, Some(NodeMask::of(self.nodes as usize, n)), node)
            }
            Placement::OnNode(node) => {
                let n = self.check(node)?;
                (Mode::Bind, Some(NodeMask::of(self.nodes as usize, n)), node)
            }
        };
        unsafe { mbind(start, len, mode, mask.as_ref(), MbindFlags::empty())? };
        Ok(node)
    }
}

impl NumaSystem for LinuxNuma {
    fn is_available(&self) -> bool {
        true
    }

    fn node_count(&self) -> u32 {
        self.nodes
    }

    fn node_total_bytes(&self, node: NodeId) -> u64 {
        self.meminfo(node, "MemTotal")
    }

    fn node_free_bytes(&self, node: NodeId) -> u64 {
        self.meminfo(node, "MemFree")
    }

    fn distance(&self, a: NodeId, b: NodeId) -> u32 {
        let (Ok(from), Ok(to)) = (self.check(a), self.check(b)) else {
            return 0;
        };
        Self::node_file(from, "distance")
            .and_then(|row| parse_distance(&row, to))
            .unwrap_or(if from == to {
                crate::LOCAL_DISTANCE
            } else {
                REMOTE_DISTANCE
            })
    }

    fn current_node(&self) -> NodeId {
        let mut cpu: c_uint = 0;
        let mut node: c_uint = 0;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_getcpu,
                &mut cpu as *mut c_uint,
                &mut node as *mut c_uint,
                ptr::null_mut::<c_void>(),
            )
        };
        match Errno::result(ret) {
            Ok(_) => node as NodeId,
            Err(_) => 0,
        }
    }

    fn current_cpu(&self) -> usize {
        sched::sched_getcpu().unwrap_or(0)
    }

    fn preferred_node(&self) -> NodeId {
        let mut mask = NodeMask::empty(self.nodes as usize);
        match get_mempolicy(Some(&mut mask), PolicyQuery::empty()) {
            Ok(mode) if mode == Mode::Preferred as c_int || mode == Mode::Bind as c_int => mask
                .first()
                .map_or_else(|| self.current_node(), |n| n as NodeId),
            _ => self.current_node(),
        }
    }

    fn set_preferred_node(&self, node: NodeId) -> Result<()> {
        if node < 0 {
            return set_mempolicy(Mode::Default, None);
        }
        let n = self.check(node)?;
        set_mempolicy(
            Mode::Preferred,
            Some(&NodeMask::of(self.nodes as usize, n)),
        )
    }

    fn set_local_policy(&self) -> Result<()> {
        set_mempolicy(Mode::Local, None)
    }

    fn bind_thread(&self, node: NodeId) -> Result<()> {
        let set = if node < 0 {
            Self::cpu_set(0..CpuSet::count())?
        } else {
            let n = self.check(node)?;
            Self::cpu_set(self.node_cpus(n)?)?
        };
        sched::sched_setaffinity(Pid::from_raw(0), &set)?;
        Ok(())
    }

    unsafe fn copy_range_to_node(&self, address: u64, len: u64, node: NodeId) -> Result<()> {
        let n = self.check(node)?;
        if len == 0 {
            return Ok(());
        }
        let start = memory_addr::align_down(address as usize, self.page_size);
        let end = memory_addr::align_up(address as usize + len as usize, self.page_size);
        let mask = NodeMask::of(self.nodes as usize, n);
        unsafe { mbind(start, end - start, Mode::Bind, Some(&mask), MbindFlags::MOVE) }
    }

    fn affinity(&self) -> Result<CpuMask> {
        let set = sched::sched_getaffinity(Pid::from_raw(0))?;
        let mut mask = CpuMask::new(CpuSet::count());
        for cpu in 0..CpuSet::count() {
            if set.is_set(cpu)? {
                mask.set(cpu);
            }
        }
        Ok(mask)
    }

    fn set_affinity(&self, mask: &CpuMask) -> Result<()> {
        let set = Self::cpu_set(mask.iter())?;
        sched::sched_setaffinity(Pid::from_raw(0), &set)?;
        Ok(())
    }
}

impl RawMemory for LinuxNuma {
    fn allocate(&self, size: u64, placement: Placement) -> Result<u64> {
        let failure = Error::AllocationFailure {
            requested: size,
            node: placement.node().unwrap_or(crate::NO_NODE),
        };
        let len = usize::try_from(size)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or(failure.clone())?;

        let ptr = unsafe {
            nix::sys::mman::mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|_| failure)?;
        let start = ptr.as_ptr().addr();

        match unsafe { self.place(start, len.get(), placement) } {
            Ok(_) => {}
            Err(err @ Error::InvalidNode { .. }) => {
                let _ = unsafe { nix::sys::mman::munmap(ptr, len.get()) };
                return Err(err);
            }
            // The mapping is still usable, only the placement is not honoured.
            Err(err) => log!(warn, "mbind for {} failed: {}", placement, err),
        }
        Ok(start as u64)
    }

    unsafe fn free(&self, address: u64, size: u64) -> Result<()> {
        let Some(ptr) = NonNull::new(address as usize as *mut c_void) else {
            return Ok(());
        };
        unsafe { nix::sys::mman::munmap(ptr, size as usize)? };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::ffi::c_int;
    use std::thread;

    use super::{
        LinuxNuma, Mode, NodeMask, PolicyQuery, get_mempolicy, parse_distance, parse_list,
        parse_meminfo,
    };
    use crate::error::Error;
    use crate::node::{CpuMask, NO_NODE, Placement};
    use crate::sys::{NumaSystem, RawMemory};

    /// Runs `f` on a fresh thread so policy and affinity changes die with it.
    fn on_host(f: impl FnOnce(LinuxNuma) + Send + 'static) {
        let Some(numa) = LinuxNuma::probe() else {
            return;
        };
        if let Err(panic) = thread::spawn(move || f(numa)).join() {
            std::panic::resume_unwind(panic);
        }
    }

    /// First node this thread may take memory from.
    fn allowed_node(numa: &LinuxNuma) -> i32 {
        let mut mask = NodeMask::empty(numa.node_count() as usize);
        get_mempolicy(Some(&mut mask), PolicyQuery::MEMS_ALLOWED).unwrap();
        mask.first().unwrap() as i32
    }

    fn mode() -> c_int {
        get_mempolicy(None, PolicyQuery::empty()).unwrap()
    }

    #[test]
    fn list_format() {
        assert_eq!(parse_list("0\n"), Some(vec![0]));
        assert_eq!(parse_list("0-3"), Some(vec![0, 1, 2, 3]));
        assert_eq!(parse_list("0-1,4,6-7\n"), Some(vec![0, 1, 4, 6, 7]));
        assert_eq!(parse_list(""), Some(vec![]));
        assert_eq!(parse_list("3-1"), None);
        assert_eq!(parse_list("a"), None);
    }

    #[test]
    fn meminfo_format() {
        const MEMINFO: &str = "Node 1 MemTotal:       16318412 kB\n\
                               Node 1 MemFree:         1024 kB\n\
                               Node 1 MemUsed:        16317388 kB\n\
                               Node 1 HugePages_Total:     0\n";
        assert_eq!(parse_meminfo(MEMINFO, "MemTotal"), Some(16318412 * 1024));
        assert_eq!(parse_meminfo(MEMINFO, "MemFree"), Some(1024 * 1024));
        assert_eq!(parse_meminfo(MEMINFO, "HugePages_Total"), Some(0));
        assert_eq!(parse_meminfo(MEMINFO, "Active"), None);
    }

    #[test]
    fn distance_row() {
        let row = "10 21 31 21\n";
        assert_eq!(parse_distance(row, 0), Some(10));
        assert_eq!(parse_distance(row, 2), Some(31));
        assert_eq!(parse_distance(row, 4), None);
    }

    #[test]
    fn node_mask() {
        let mask = NodeMask::of(4, 2);
        assert_eq!(mask.first(), Some(2));
        assert_eq!(mask.maxnode(), 65);
        assert_eq!(NodeMask::empty(4).first(), None);
        assert_eq!(NodeMask::of(1, 70).0.len(), 2);
    }

    #[test]
    fn host_topology() {
        let Some(numa) = LinuxNuma::probe() else {
            return;
        };
        assert!(numa.node_count() >= 1);
        let node = numa.online_nodes()[0] as i32;
        assert_eq!(numa.distance(node, node), 10);
        assert!(numa.node_free_bytes(node) <= numa.node_total_bytes(node));
        assert_eq!(numa.distance(-1, node), 0);

        let addr = numa.allocate(1 << 16, Placement::OnNode(node)).unwrap();
        unsafe {
            (addr as usize as *mut u64).write(0xdead_beef);
            numa.free(addr, 1 << 16).unwrap();
        }
        assert!(numa.allocate(4096, Placement::OnNode(numa.node_count() as i32)).is_err());
    }

    #[test]
    fn preferred_node_roundtrip() {
        on_host(|numa| {
            let node = allowed_node(&numa);
            numa.set_preferred_node(node).unwrap();
            assert_eq!(mode(), Mode::Preferred as c_int);
            assert_eq!(numa.preferred_node(), node);

            numa.set_preferred_node(NO_NODE).unwrap();
            assert_eq!(mode(), Mode::Default as c_int);

            let invalid = numa.node_count() as i32;
            assert_eq!(
                numa.set_preferred_node(invalid).unwrap_err(),
                Error::InvalidNode {
                    node: invalid,
                    nodes: numa.node_count()
                }
            );
            assert_eq!(mode(), Mode::Default as c_int);
        });
    }

    #[test]
    fn local_policy() {
        on_host(|numa| {
            numa.set_local_policy().unwrap();
            // Older kernels report local allocation as preferred with no node.
            assert!([Mode::Local as c_int, Mode::Preferred as c_int].contains(&mode()));
            numa.set_preferred_node(NO_NODE).unwrap();
        });
    }

    #[test]
    fn bind_thread_and_affinity() {
        on_host(|numa| {
            let original = numa.affinity().unwrap();
            assert!(!original.is_empty());

            let node = numa.current_node();
            let cpus = numa.node_cpus(node as usize).unwrap();
            numa.bind_thread(node).unwrap();
            let bound = numa.affinity().unwrap();
            assert!(!bound.is_empty());
            assert!(
                bound.iter().all(|cpu| cpus.contains(&cpu)),
                "{:?} not on node {}",
                bound,
                node
            );

            numa.bind_thread(NO_NODE).unwrap();
            let unbound = numa.affinity().unwrap();
            assert!(original.iter().all(|cpu| unbound.contains(cpu)));

            let cpu = bound.iter().next().unwrap();
            let single: CpuMask = [cpu].into_iter().collect();
            numa.set_affinity(&single).unwrap();
            assert_eq!(numa.affinity().unwrap().iter().collect::<Vec<_>>(), vec![cpu]);

            numa.set_affinity(&original).unwrap();
            assert_eq!(numa.affinity().unwrap(), original);

            assert!(numa.bind_thread(numa.node_count() as i32).is_err());
        });
    }

    #[test]
    fn moves_ranges_between_nodes() {
        on_host(|numa| {
            let node = allowed_node(&numa);
            let size = 4 * numa.page_size() as u64;
            let addr = numa.allocate(size, Placement::Local).unwrap();
            unsafe {
                let words = addr as usize as *mut u64;
                words.write(0x5eed);
                // Unaligned ranges cover every page they touch.
                numa.copy_range_to_node(addr + 8, size - 16, node).unwrap();
                numa.copy_range_to_node(addr, 0, node).unwrap();
                assert_eq!(words.read(), 0x5eed);
            }

            let buf = vec![7u8; 3 * numa.page_size()];
            numa.copy_to_node(&buf, node).unwrap();
            assert!(buf.iter().all(|b| *b == 7));
            numa.copy_to_node(&[], numa.node_count() as i32).unwrap();

            let invalid = numa.node_count() as i32;
            assert!(matches!(
                numa.copy_to_node(&buf, invalid),
                Err(Error::InvalidNode { .. })
            ));
            assert!(unsafe { numa.copy_range_to_node(addr, size, NO_NODE) }.is_err());
            unsafe { numa.free(addr, size).unwrap() };
        });
    }
}
