//! The core, UI-agnostic library for the `imagerpi` SD card imaging utility.
//!
//! `imagerpi-core` captures block devices to raw image files and deploys
//! image files back to block devices. Before a capture it can shrink the
//! ext filesystem on the device's last partition, and then the partition
//! itself, so the image only covers the data that is actually in use.
//!
//! The library is structured into several modules:
//! - [`size`]: Parsing of human-readable sizes such as `512K`.
//! - [`device`]: The `Device` struct and block device ioctls.
//! - [`platform`]: Device discovery, partition node names and mount lookups.
//! - [`partition`]: Reading and editing the MBR partition table.
//! - [`filesystem`]: ext superblock probing and the e2fsprogs driver.
//! - [`shrink`]: Shrinking the last filesystem and partition.
//! - [`copy`]: The chunked, cancellable copy loop.
//! - [`capture`] and [`deploy`]: The two imaging operations.
//!
//! Progress is reported through callbacks so that any front-end can render
//! it. Cancellation goes through a shared `Arc<AtomicBool>`.
//!
//! ## Example: Capturing a Card with Progress Reporting
//!
//! ```rust,no_run
//! use imagerpi_core::capture::{self, CaptureOptions};
//! use imagerpi_core::filesystem::E2fsprogs;
//! use std::path::Path;
//! use std::sync::{Arc, atomic::AtomicBool};
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let running = Arc::new(AtomicBool::new(true));
//!
//!     let report = capture::run(
//!         Path::new("/dev/mmcblk0"),
//!         Path::new("raspios.img"),
//!         &CaptureOptions::default(),
//!         &E2fsprogs,
//!         running,
//!         |total| println!("capturing {total} bytes"),
//!         |copied| println!("{copied} bytes copied"),
//!     )?;
//!
//!     println!("image is {} bytes", report.length);
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod copy;
pub mod deploy;
pub mod device;
pub mod filesystem;
pub mod partition;
pub mod platform;
pub mod shrink;
pub mod size;
