#![allow(clippy::str_to_string)]
use bytesize::ByteSize;
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use serde::Deserialize;
use serde_valid::toml::FromTomlStr;
use serde_valid::Validate;
use std::path::PathBuf;

use crate::consts::{self, DEFAULT_CFG_PATH};

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Image {
    /// Output file, relative to the working directory.
    #[validate(min_length = 1)]
    pub output: String,
    pub size: ByteSize,
    /// End of the ESP, measured from the start of the image.
    pub esp_size: ByteSize,
    /// Leave the backing file sparse instead of preallocating every block.
    pub sparse: bool,
    /// Parent directory for the temporary mount root.
    pub workdir: Option<PathBuf>,
}

impl Default for Image {
    fn default() -> Self {
        Self {
            output: consts::IMAGE_NAME.into(),
            size: consts::IMAGE_SIZE,
            esp_size: consts::ESP_END,
            sparse: true,
            workdir: None,
        }
    }
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Packages {
    /// Removed together with their no longer needed dependencies.
    pub remove: Vec<String>,
    pub install: Vec<String>,
    #[validate(min_items = 1)]
    pub locale_command: Vec<String>,
}

impl Default for Packages {
    fn default() -> Self {
        Self {
            remove: consts::INSTALLER_PACKAGES.map(String::from).to_vec(),
            install: consts::BOOT_PACKAGES.map(String::from).to_vec(),
            locale_command: vec!["locale-gen".into()],
        }
    }
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Boot {
    #[validate(min_length = 1)]
    pub target: String,
    pub bootloader_id: Option<String>,
    /// Install to the fallback `EFI/BOOT` path so the image boots on any machine.
    pub removable: bool,
    /// Write boot entries into the *host's* firmware variables. Almost never what you want.
    pub update_nvram: bool,
}

impl Default for Boot {
    fn default() -> Self {
        Self {
            target: consts::grub_target().into(),
            bootloader_id: None,
            removable: true,
            update_nvram: false,
        }
    }
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Privilege {
    /// Program used to re-execute efimg as root, e.g. `sudo` or `pkexec`.
    #[validate(min_length = 1)]
    pub helper: String,
}

impl Default for Privilege {
    fn default() -> Self {
        Self {
            helper: "sudo".into(),
        }
    }
}

#[derive(Deserialize, Validate, Default, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EfimgConfig {
    #[validate]
    pub image: Image,
    #[validate]
    pub packages: Packages,
    #[validate]
    pub boot: Boot,
    #[validate]
    pub privilege: Privilege,
}

impl EfimgConfig {
    /// # Errors
    /// - the TOML is malformed or a field fails validation
    /// - the ESP doesn't fit inside the image
    pub fn parse(toml: &str) -> Result<Self> {
        let cfg = Self::from_toml_str(toml)?;
        cfg.check_layout()?;
        Ok(cfg)
    }

    fn check_layout(&self) -> Result<()> {
        let Image { size, esp_size, .. } = &self.image;
        if esp_size.as_u64() == 0 {
            bail!("image.esp_size must not be zero");
        }
        if esp_size >= size {
            bail!("image.esp_size ({esp_size}) must be smaller than image.size ({size})");
        }
        Ok(())
    }
}

/// Load the configuration from `EFIMG_CONFIG`, falling back to [`DEFAULT_CFG_PATH`].
///
/// A missing default file is fine and yields the built-in defaults; a missing file that
/// was explicitly asked for is not.
///
/// # Errors
/// - cannot read or parse config file
#[tracing::instrument]
pub fn get_cfg() -> Result<EfimgConfig> {
    let path = std::env::var("EFIMG_CONFIG");
    match &path {
        Err(std::env::VarError::NotUnicode(s)) => {
            tracing::error!(?s, "Cannot parse EFIMG_CONFIG due to invalid unicode");
            tracing::debug!("Falling back to {DEFAULT_CFG_PATH}");
        }
        Ok(p) => tracing::debug!("Using EFIMG_CONFIG={p}"),
        Err(std::env::VarError::NotPresent) => tracing::trace!("Using {DEFAULT_CFG_PATH}"),
    }
    let explicit = path.is_ok();
    let path = path.as_deref().unwrap_or(DEFAULT_CFG_PATH);
    let toml = match std::fs::read_to_string(path) {
        Ok(toml) => toml,
        Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {path}, using defaults");
            return Ok(EfimgConfig::default());
        }
        Err(e) => return Err(eyre!("Cannot read config file at {path:?}").wrap_err(e)),
    };
    EfimgConfig::parse(&toml)
}
