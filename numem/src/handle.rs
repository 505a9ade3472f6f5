use crate::node::{NO_NODE, NodeId};

/// Plain description of one allocation.
///
/// A handle does not own anything; it is what the registry arbitrates on
/// when releasing. The empty handle (address 0) stands for "no allocation".
///
/// Handles handed out by a registry also carry the id of their allocation.
/// Release only accepts a handle whose id matches the registered block, so a
/// handle kept past its release can't free a later block at the same address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle {
    address: u64,
    size: u64,
    node: NodeId,
    id: u64,
}

impl MemoryHandle {
    pub const EMPTY: Self = Self {
        address: 0,
        size: 0,
        node: NO_NODE,
        id: 0,
    };

    /// An empty handle is returned for a null `address` regardless of the
    /// other arguments. The handle belongs to no allocation, so no registry
    /// will release anything for it.
    #[inline]
    pub const fn new(address: u64, size: u64, node: NodeId) -> Self {
        Self::with_id(address, size, node, 0)
    }

    #[inline]
    pub(crate) const fn with_id(address: u64, size: u64, node: NodeId, id: u64) -> Self {
        if address == 0 {
            return Self::EMPTY;
        }
        Self {
            address,
            size,
            node,
            id,
        }
    }

    #[inline]
    pub const fn empty() -> Self {
        Self::EMPTY
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.address == 0
    }

    #[inline]
    pub const fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub const fn node(&self) -> NodeId {
        self.node
    }

    /// Id of the allocation, 0 for a handle no registry handed out.
    #[inline]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.address as usize as *mut u8
    }
}

impl Default for MemoryHandle {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl core::fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("node", &self.node)
            .field("id", &self.id)
            .finish()
    }
}
