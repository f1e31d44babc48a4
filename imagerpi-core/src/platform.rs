//! Provides platform-specific functionality.
//!
//! Device discovery, partition node naming and mount lookups depend on the
//! operating system. Shrinking talks to the kernel through Linux block
//! ioctls and e2fsprogs, so Linux is the only supported target; the
//! `#[cfg]` split keeps the public API in one place should another platform
//! be added.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
compile_error!("imagerpi-core only supports Linux block devices");
