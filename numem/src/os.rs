//! Concrete NUMA backends.

#[cfg(all(target_os = "linux", feature = "unix"))]
pub mod linux;
pub mod stub;

#[cfg(all(target_os = "linux", feature = "unix"))]
pub use self::linux::LinuxNuma;
pub use self::stub::NoNuma;
