//! Firmware package model and on-disk manifests.
//!
//! A [`FirmwarePackage`] is the fully downloaded, chunked firmware image as
//! the vendor cloud delivers it: 1-based packages plus the metadata the
//! device needs in the Prepare/SendData/Reset frames.
//!
//! Packages are assembled from a TOML manifest that either lists one file
//! per package or points at a single image to split:
//!
//! ```toml
//! name = "LXP-LB-8-12K fAAB-2525"
//! file_type = 1
//! checksum32 = 0x1C2B3A49
//! tail_marker = [0x5A, 0xA5, 0x00, 0x01]
//! variant = "standard"
//! image = "fAAB-2525.bin"
//! chunk_size = 512
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid manifest: {0}")]
    Manifest(#[from] toml::de::Error),
    #[error("Package has no data")]
    Empty,
    #[error("Package index 0 is invalid (indices are 1-based)")]
    IndexZero,
    #[error("Duplicate package index {0}")]
    DuplicateIndex(u16),
    #[error("Too many packages: {0} (max {max})", max = u16::MAX)]
    TooManyPackages(usize),
    #[error("Invalid chunk size {0}")]
    InvalidChunkSize(usize),
    #[error("Manifest must set either `image` or `packages`")]
    NoPayloadSource,
    #[error("Lux manifest requires `length_table`")]
    MissingLengthTable,
    #[error("File type 2 requires a physical address for package {0}")]
    MissingPhysicalAddress(u16),
    #[error("File type 2 needs per-package addresses; list `packages` instead of `image`")]
    ImageWithoutAddresses,
}

/// Lux-only frame metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuxExtras {
    /// Raw 4-byte length table copied into every SendData frame.
    pub length_table: [u8; 4],
    /// Present for Lux device dialects that use the Lux reset path.
    pub file_handle_type: Option<u8>,
}

/// Frame encoding dialect.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProtocolVariant {
    #[default]
    Standard,
    Lux(LuxExtras),
}

impl ProtocolVariant {
    /// True when the Reset frame follows the Lux dialect.
    pub fn uses_lux_reset(&self) -> bool {
        matches!(
            self,
            ProtocolVariant::Lux(LuxExtras {
                file_handle_type: Some(_),
                ..
            })
        )
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVariant::Standard => write!(f, "Standard"),
            ProtocolVariant::Lux(_) => write!(f, "Lux"),
        }
    }
}

/// A fully downloaded firmware package ready to be pushed to a device.
#[derive(Debug, Clone)]
pub struct FirmwarePackage {
    /// Display name (file name on the vendor server).
    pub name: Option<String>,
    /// Address mode: 1/3 = fixed file size, 2 = per-package physical address.
    pub file_type: u8,
    /// Total image length, sent as the address field for file types 1 and 3.
    pub file_size: u32,
    /// Whole-image checksum supplied by the server.
    pub checksum32: u32,
    /// Raw marker bytes embedded in the Prepare frame.
    pub tail_marker: [u8; 4],
    pub variant: ProtocolVariant,
    /// Package index -> physical address (file type 2 only).
    pub physical_addresses: BTreeMap<u16, u32>,
    /// Package index -> firmware bytes.
    pub packages: BTreeMap<u16, Vec<u8>>,
    /// Overrides the package count in the Reset frame.
    pub bms_header_id: Option<u16>,
    /// Whether every package has been downloaded.
    pub done_download: bool,
}

impl FirmwarePackage {
    pub fn new(file_type: u8, file_size: u32, checksum32: u32, tail_marker: [u8; 4]) -> Self {
        Self {
            name: None,
            file_type,
            file_size,
            checksum32,
            tail_marker,
            variant: ProtocolVariant::Standard,
            physical_addresses: BTreeMap::new(),
            packages: BTreeMap::new(),
            bms_header_id: None,
            done_download: true,
        }
    }

    /// Split `image` into 1-based packages of at most `chunk_size` bytes.
    pub fn split_image(&mut self, image: &[u8], chunk_size: usize) -> Result<(), PackageError> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(PackageError::InvalidChunkSize(chunk_size));
        }
        let count = image.len().div_ceil(chunk_size);
        if count > u16::MAX as usize {
            return Err(PackageError::TooManyPackages(count));
        }
        self.packages = image
            .chunks(chunk_size)
            .zip(1u16..)
            .map(|(chunk, index)| (index, chunk.to_vec()))
            .collect();
        Ok(())
    }

    /// Number of packages N (the highest index; indices are dense from 1).
    pub fn package_count(&self) -> u16 {
        self.packages.keys().next_back().copied().unwrap_or(0)
    }

    /// Firmware bytes for a 1-based package index.
    pub fn payload(&self, index: u16) -> Option<&[u8]> {
        self.packages.get(&index).map(Vec::as_slice)
    }

    /// Whether SendData frames carry per-package physical addresses.
    pub fn uses_physical_addresses(&self) -> bool {
        self.variant == ProtocolVariant::Standard && self.file_type == 2
    }

    /// First package in `1..=N` with no physical address, when addresses are
    /// required.
    pub fn first_missing_address(&self) -> Option<u16> {
        if !self.uses_physical_addresses() {
            return None;
        }
        (1..=self.package_count()).find(|index| !self.physical_addresses.contains_key(index))
    }

    /// Count encoded in the Reset frame.
    pub fn reset_count(&self, package_count: u16) -> u16 {
        self.bms_header_id.unwrap_or(package_count)
    }

    /// Sum of all package payload lengths.
    pub fn total_bytes(&self) -> usize {
        self.packages.values().map(Vec::len).sum()
    }

    /// Load a package from a TOML manifest.
    pub fn load_manifest<P: AsRef<Path>>(path: P) -> Result<Self, PackageError> {
        PackageManifest::load_from_file(path)?.into_package()
    }
}

/// Largest payload whose `len + 4` still fits the u16 length field.
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize - 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    #[default]
    Standard,
    Lux,
}

/// One explicitly listed package in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageEntry {
    pub index: u16,
    pub path: PathBuf,
    pub physical_address: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// On-disk description of a [`FirmwarePackage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: Option<String>,
    pub file_type: u8,
    /// Defaults to the total payload length.
    pub file_size: Option<u32>,
    pub checksum32: u32,
    pub tail_marker: [u8; 4],
    #[serde(default)]
    pub variant: VariantKind,
    pub length_table: Option<[u8; 4]>,
    pub file_handle_type: Option<u8>,
    pub bms_header_id: Option<u16>,
    #[serde(default = "default_true")]
    pub done_download: bool,
    /// Single image to split into `chunk_size` packages.
    pub image: Option<PathBuf>,
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub packages: Vec<PackageEntry>,
    /// Directory relative paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl PackageManifest {
    /// Default chunk size when splitting an image.
    pub const DEFAULT_CHUNK_SIZE: usize = 512;

    pub fn from_toml(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self, PackageError> {
        let mut manifest: PackageManifest = toml::from_str(content)?;
        manifest.base_dir = base_dir.into();
        Ok(manifest)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PackageError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| PackageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_toml(&content, base_dir)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, PackageError> {
        let full = self.resolve(path);
        debug!(path = %full.display(), "Reading package data");
        std::fs::read(&full).map_err(|source| PackageError::Io { path: full, source })
    }

    /// Read the referenced files and build the package.
    pub fn into_package(self) -> Result<FirmwarePackage, PackageError> {
        let variant = match self.variant {
            VariantKind::Standard => ProtocolVariant::Standard,
            VariantKind::Lux => ProtocolVariant::Lux(LuxExtras {
                length_table: self.length_table.ok_or(PackageError::MissingLengthTable)?,
                file_handle_type: self.file_handle_type,
            }),
        };

        let mut package =
            FirmwarePackage::new(self.file_type, 0, self.checksum32, self.tail_marker);
        package.name = self.name.clone();
        package.variant = variant;
        package.bms_header_id = self.bms_header_id;
        package.done_download = self.done_download;

        if let Some(image_path) = &self.image {
            if package.uses_physical_addresses() {
                return Err(PackageError::ImageWithoutAddresses);
            }
            let image = self.read(image_path)?;
            package.split_image(&image, self.chunk_size.unwrap_or(Self::DEFAULT_CHUNK_SIZE))?;
        } else if !self.packages.is_empty() {
            if self.packages.len() > u16::MAX as usize {
                return Err(PackageError::TooManyPackages(self.packages.len()));
            }
            for entry in &self.packages {
                if entry.index == 0 {
                    return Err(PackageError::IndexZero);
                }
                let data = self.read(&entry.path)?;
                if package.packages.insert(entry.index, data).is_some() {
                    return Err(PackageError::DuplicateIndex(entry.index));
                }
                match entry.physical_address {
                    Some(addr) => {
                        package.physical_addresses.insert(entry.index, addr);
                    }
                    None if package.uses_physical_addresses() => {
                        return Err(PackageError::MissingPhysicalAddress(entry.index));
                    }
                    None => {}
                }
            }
        } else {
            return Err(PackageError::NoPayloadSource);
        }

        if package.packages.is_empty() {
            return Err(PackageError::Empty);
        }

        package.file_size = match self.file_size {
            Some(size) => size,
            None => package.total_bytes() as u32,
        };

        info!(
            name = package.name.as_deref().unwrap_or("<unnamed>"),
            variant = %package.variant,
            packages = package.package_count(),
            bytes = package.total_bytes(),
            "Loaded firmware package"
        );
        Ok(package)
    }
}
