use std::sync::Arc;

use crate::error::{Error, Result};
use crate::handle::MemoryHandle;
use crate::node::NodeId;
use crate::tracker::{Access, Tracked};

/// Owning guard of one registered block.
///
/// Dropping the guard hands the block back to its registry, through the
/// collector or inline depending on the registry's [`Reclamation`]. Share it
/// with `Arc<Memory>` when several owners are needed; the block is reclaimed
/// once the last of them is gone.
///
/// Contents are read through `&self` and written through `&mut self`. Every
/// access is bounds checked and fails with [`Error::Released`] once the block
/// was released, including by [`AllocationRegistry::release`] on its handle.
///
/// [`Reclamation`]: crate::Reclamation
/// [`AllocationRegistry::release`]: crate::AllocationRegistry::release
pub struct Memory {
    inner: Option<Arc<Tracked>>,
}

impl Memory {
    pub(crate) fn tracked(inner: Arc<Tracked>) -> Self {
        Self { inner: Some(inner) }
    }

    /// The guard of a zero sized allocation. It owns nothing.
    #[inline]
    pub const fn empty() -> Self {
        Self { inner: None }
    }

    pub fn handle(&self) -> MemoryHandle {
        self.inner
            .as_ref()
            .map_or(MemoryHandle::EMPTY, |t| t.handle())
    }

    #[inline]
    pub fn address(&self) -> u64 {
        self.handle().address()
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.handle().size()
    }

    #[inline]
    pub fn node(&self) -> NodeId {
        self.handle().node()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Whether the block was released, explicitly or through its handle.
    /// The empty guard is never released.
    pub fn is_released(&self) -> bool {
        self.inner.as_ref().is_some_and(|t| t.is_released())
    }

    /// Start of the block. Dereferencing it is only valid while the block has
    /// not been released.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.handle().as_ptr()
    }

    /// Releases the block now instead of on drop.
    pub fn release(mut self) {
        if let Some(t) = self.inner.take() {
            t.release();
        }
    }

    fn access(&self, offset: u64, len: u64) -> Result<Option<Access<'_>>> {
        let size = self.size();
        let out = Error::OutOfBounds { offset, len, size };
        match offset.checked_add(len) {
            Some(end) if end <= size => {}
            _ => return Err(out),
        }
        match &self.inner {
            // Only zero length accesses reach here for the empty guard.
            None => Ok(None),
            Some(t) => t.enter().map(Some),
        }
    }

    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let Some(a) = self.access(offset, buf.len() as u64)? else {
            return Ok(());
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                a.ptr().add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
        Ok(())
    }

    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let Some(a) = self.access(offset, data.len() as u64)? else {
            return Ok(());
        };
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), a.ptr().add(offset as usize), data.len())
        };
        Ok(())
    }

    /// Sets every byte of the block to `value`.
    pub fn fill(&mut self, value: u8) -> Result<()> {
        let size = self.size();
        let Some(a) = self.access(0, size)? else {
            return Ok(());
        };
        unsafe { a.ptr().write_bytes(value, size as usize) };
        Ok(())
    }

    #[inline]
    pub fn clear(&mut self) -> Result<()> {
        self.fill(0)
    }
}

macro_rules! typed_access {
    ($($ty:ident),* $(,)?) => {
        paste::paste! {
            impl Memory {
                $(
                    #[doc = concat!("Reads a native endian `", stringify!($ty), "` at `offset`.")]
                    pub fn [<get_ $ty>](&self, offset: u64) -> Result<$ty> {
                        let len = size_of::<$ty>() as u64;
                        let a = self.access(offset, len)?.ok_or(Error::OutOfBounds {
                            offset,
                            len,
                            size: 0,
                        })?;
                        Ok(unsafe { a.ptr().add(offset as usize).cast::<$ty>().read_unaligned() })
                    }

                    #[doc = concat!("Writes a native endian `", stringify!($ty), "` at `offset`.")]
                    pub fn [<put_ $ty>](&mut self, offset: u64, value: $ty) -> Result<()> {
                        let len = size_of::<$ty>() as u64;
                        let a = self.access(offset, len)?.ok_or(Error::OutOfBounds {
                            offset,
                            len,
                            size: 0,
                        })?;
                        unsafe { a.ptr().add(offset as usize).cast::<$ty>().write_unaligned(value) };
                        Ok(())
                    }
                )*
            }
        }
    };
}

typed_access!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Default for Memory {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for Memory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Memory")
            .field("handle", &self.handle())
            .field("released", &self.is_released())
            .finish()
    }
}
