//! Provision bootable EFI disk images from a compressed root filesystem archive.
//!
//! The pipeline lives in [`backend::install`]; every privileged side effect goes
//! through [`backend::host::Host`] so the ordering and teardown logic can be
//! exercised without root.
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod cfg;
pub mod consts;
pub mod error;
pub mod inventory;
pub mod prelude;
pub mod util;

// Also, fail compilation on non-Linux platforms
#[cfg(not(target_os = "linux"))]
compile_error!(
    "efimg does not support non-Linux platforms, loop devices and chroot are Linux-specific."
);
