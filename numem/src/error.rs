use crate::node::NodeId;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Clone, PartialEq, Eq)]
pub enum Error {
    /// The platform offers no NUMA control.
    PlatformUnavailable,
    /// The native allocator refused the request.
    AllocationFailure { requested: u64, node: NodeId },
    InvalidNode { node: NodeId, nodes: u32 },
    /// The block behind a guard was already released.
    Released,
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[cfg(all(unix, feature = "unix"))]
    Os(nix::Error),
}

impl core::error::Error for Error {}

impl core::fmt::Debug for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::PlatformUnavailable => write!(f, "NUMA is not available on this platform"),
            Self::AllocationFailure { requested, node } => write!(
                f,
                "Allocation failed, requested {} bytes on node {}",
                requested, node
            ),
            Self::InvalidNode { node, nodes } => {
                write!(f, "Invalid node {}, the system has {} nodes", node, nodes)
            }
            Self::Released => write!(f, "Memory already released"),
            Self::OutOfBounds { offset, len, size } => write!(
                f,
                "Access out of bounds, offset {}, length {}, size {}",
                offset, len, size
            ),
            #[cfg(all(unix, feature = "unix"))]
            Self::Os(err) => write!(f, "System call failed: {:?}", err),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

#[cfg(all(unix, feature = "unix"))]
impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::Os(err)
    }
}
