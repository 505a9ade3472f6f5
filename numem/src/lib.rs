//! NUMA-aware off-heap memory with tracked lifetimes.
//!
//! Blocks are requested from an [`AllocationRegistry`] bound to a memory node,
//! the calling thread's node, or an interleaved/local policy. The registry
//! keeps per-node byte counts of everything outstanding and reclaims blocks
//! whose owning [`Memory`] guards were all dropped, on a background collector
//! thread.
//!
//! ```no_run
//! use numem::{AllocationRegistry, Backend};
//!
//! let reg = AllocationRegistry::builder().build(Backend::probe());
//! let mut mem = reg.allocate(4096, 0).unwrap();
//! mem.put_u64(0, 42).unwrap();
//! assert_eq!(reg.allocated_size(0), 4096);
//! mem.release();
//! assert_eq!(reg.allocated_size(0), 0);
//! ```

#[cfg(feature = "tracing")]
extern crate tracing;

macro_rules! log {
    ($lvl:ident, $($arg:tt)+) => {{
        #[cfg(feature = "tracing")]
        tracing::$lvl!($($arg)+);
        #[cfg(not(feature = "tracing"))]
        {
            let _ = format_args!($($arg)+);
        }
    }};
}

mod backend;
mod collector;
mod error;
pub mod global;
mod handle;
mod memory;
mod node;
pub mod os;
mod registry;
mod sys;
mod tests;
mod tracker;

pub use self::backend::Backend;
pub use self::error::{Error, Result};
pub use self::handle::MemoryHandle;
pub use self::memory::Memory;
pub use self::node::{CpuMask, NO_NODE, NodeId, Placement};
pub use self::registry::{AllocationRegistry, Reclamation, RegistryBuilder, RegistryConfig};
pub use self::sys::{NumaSystem, RawMemory};
pub use self::tracker::WeakTracker;

/// Distance reported between a node and itself.
pub const LOCAL_DISTANCE: u32 = 10;
