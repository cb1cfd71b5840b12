use bytesize::ByteSize;

/// File name of the finished image, relative to the working directory.
pub const IMAGE_NAME: &str = "efi.img";
pub const IMAGE_SIZE: ByteSize = ByteSize::gib(8);
/// The ESP spans from the start of the image up to this boundary.
pub const ESP_END: ByteSize = ByteSize::mib(256);

pub const ESP_LABEL: &str = "EFI";
pub const ROOT_LABEL: &str = "root";

/// Where the ESP lives inside the installed system.
pub const ESP_MOUNTPOINT: &str = "/boot/efi";
pub const GRUB_CFG: &str = "/boot/grub/grub.cfg";
pub const FSTAB: &str = "/etc/fstab";

pub const ROOT_FSTAB_OPTIONS: &str = "errors=remount-ro";
pub const ESP_FSTAB_OPTIONS: &str = "umask=0077";

/// Host pseudo-filesystems bound into the contained root before any chroot command runs.
pub const PSEUDO_FILESYSTEMS: [&str; 3] = ["/dev", "/proc", "/sys"];

pub const DEFAULT_CFG_PATH: &str = "/etc/efimg.toml";
pub const HOST_MOUNTS: &str = "/proc/self/mounts";

/// Packages that only make sense on the live installer medium.
pub const INSTALLER_PACKAGES: [&str; 4] = ["casper", "ubiquity", "ubiquity-casper", "lupin-casper"];
/// Boot menu and terminal tooling the installed system needs.
pub const BOOT_PACKAGES: [&str; 4] = [
    "grub-efi-amd64",
    "grub-efi-amd64-bin",
    "efibootmgr",
    "console-setup",
];

pub const fn grub_target() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "arm64-efi"
    } else {
        "x86_64-efi"
    }
}
