pub mod chroot;
pub mod format;
pub mod fstab;
pub mod grub;
pub mod host;
pub mod identity;
pub mod image;
pub mod install;
pub mod loopdev;
pub mod mounts;
pub mod populate;
pub mod privilege;
pub mod teardown;

#[cfg(test)]
pub mod testing;
