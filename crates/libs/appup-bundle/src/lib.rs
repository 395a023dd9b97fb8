#![forbid(unsafe_code)]

//! Read-only access to update metadata embedded in AppImage files.
//!
//! An AppImage is simultaneously a native executable and a filesystem
//! image. This crate detects which of the two format variants a file
//! uses, extracts the embedded metadata sections, and computes the
//! canonical hash used for signing, where the bytes of the signature
//! and signing-key sections are replaced by zeros.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use reportify::{bail, Report, ResultExt};
use tracing::warn;

pub mod elf;

mod hash;

reportify::new_whatever_type! {
    /// Error reading an AppImage.
    BundleError
}

/// Result with [`BundleError`] as error type.
pub type BundleResult<T> = Result<T, Report<BundleError>>;

/// ELF section holding the raw update information.
pub const UPDATE_INFO_SECTION: &str = ".upd_info";
/// ELF section holding the detached signature.
pub const SIGNATURE_SECTION: &str = ".sha256_sig";
/// ELF section holding the ASCII-armored signing key.
pub const SIGNING_KEY_SECTION: &str = ".sig_key";

/// Offset of the three-byte AppImage magic.
const MAGIC_OFFSET: u64 = 8;
/// Fixed offset of the type-1 update information string.
const TYPE1_UPDATE_INFO_OFFSET: u64 = 0x8373;
/// Maximum length of the type-1 update information string.
const TYPE1_UPDATE_INFO_LENGTH: usize = 512;
/// Offset of the ISO 9660 magic used by the legacy type-1 fallback.
const ISO_MAGIC_OFFSET: u64 = 32769;

/// AppImage format variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppImageType {
    /// Legacy ISO 9660 based images.
    Type1,
    /// ELF images with metadata in named sections.
    Type2,
}

impl std::fmt::Display for AppImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppImageType::Type1 => f.write_str("1"),
            AppImageType::Type2 => f.write_str("2"),
        }
    }
}

/// Outcome of AppImage type detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDetection {
    /// Detected format variant.
    pub kind: AppImageType,
    /// Set when the type-1 classification rests on the ELF and ISO
    /// magic values instead of the AppImage magic bytes.
    pub legacy_magic: bool,
}

/// Read-only view of an AppImage on disk.
///
/// The file is opened on demand; no state is cached between calls, so
/// every accessor reflects the file's current content.
#[derive(Debug, Clone)]
pub struct AppImage {
    path: PathBuf,
}

impl AppImage {
    /// Create a view of the AppImage at the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the AppImage.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detect the format variant of the AppImage.
    ///
    /// Files without the AppImage magic bytes that carry both an ELF
    /// and an ISO 9660 magic are accepted as type 1; callers should
    /// surface [`TypeDetection::legacy_magic`] to the user.
    pub fn detect_type(&self) -> BundleResult<TypeDetection> {
        let mut file = self.open()?;
        let mut magic = [0u8; 3];
        if read_at(&mut file, MAGIC_OFFSET, &mut magic)? == magic.len() && magic[..2] == *b"AI" {
            match magic[2] {
                1 => {
                    return Ok(TypeDetection {
                        kind: AppImageType::Type1,
                        legacy_magic: false,
                    })
                }
                2 => {
                    return Ok(TypeDetection {
                        kind: AppImageType::Type2,
                        legacy_magic: false,
                    })
                }
                _ => {}
            }
        }
        // Type-1 AppImages do not have to set the magic bytes. If the
        // file is both an ELF and an ISO 9660 image, we suspect it to
        // be a type-1 AppImage and proceed with a warning.
        if self.has_elf_magic(&mut file)? && self.has_iso_magic(&mut file)? {
            warn!(path = ?self.path, "AppImage magic bytes missing, assuming type 1");
            return Ok(TypeDetection {
                kind: AppImageType::Type1,
                legacy_magic: true,
            });
        }
        bail!("unknown AppImage type: {:?}", self.path);
    }

    /// Detect the format variant, discarding the legacy-magic flag.
    pub fn image_type(&self) -> BundleResult<AppImageType> {
        self.detect_type().map(|detection| detection.kind)
    }

    /// Read the raw update information string embedded in the image.
    ///
    /// Returns an empty string when the image carries no update
    /// information.
    pub fn raw_update_info(&self) -> BundleResult<String> {
        match self.image_type()? {
            AppImageType::Type1 => {
                let mut file = self.open()?;
                let mut buffer = [0u8; TYPE1_UPDATE_INFO_LENGTH];
                let read = read_at(&mut file, TYPE1_UPDATE_INFO_OFFSET, &mut buffer)?;
                Ok(cstring_prefix(&buffer[..read]))
            }
            AppImageType::Type2 => self.read_section_string(UPDATE_INFO_SECTION),
        }
    }

    /// Read the detached signature embedded in the image.
    ///
    /// Only type-2 images can carry signatures. A missing or
    /// zero-filled section yields an empty string.
    pub fn signature(&self) -> BundleResult<String> {
        self.require_type2("signature")?;
        self.read_section_string(SIGNATURE_SECTION)
    }

    /// Read the ASCII-armored signing key embedded in the image.
    pub fn signing_key(&self) -> BundleResult<String> {
        self.require_type2("signing key")?;
        self.read_section_string(SIGNING_KEY_SECTION)
    }

    /// Compute the canonical SHA-256 hash of the image.
    ///
    /// The hash covers the entire file with the bytes of the signature
    /// and signing-key sections replaced by zeros, which makes it
    /// invariant under signing. The lowercase hex encoding returned
    /// here is the exact payload covered by detached signatures.
    pub fn canonical_hash(&self) -> BundleResult<String> {
        let mut file = self.open()?;
        let mut regions = Vec::new();
        for name in [SIGNATURE_SECTION, SIGNING_KEY_SECTION] {
            if let Some(region) = elf::find_section(&mut file, name)? {
                regions.push(region);
            }
        }
        hash::hash_with_skip_regions(&mut file, &regions)
            .with_info(|_| format!("path: {:?}", self.path))
    }

    fn open(&self) -> BundleResult<File> {
        File::open(&self.path)
            .whatever_with(|_| format!("unable to open AppImage {:?}", self.path))
    }

    fn require_type2(&self, what: &str) -> BundleResult<()> {
        let kind = self.image_type()?;
        if kind != AppImageType::Type2 {
            bail!("reading the {what} is not supported for type {kind} AppImages");
        }
        Ok(())
    }

    fn read_section_string(&self, name: &str) -> BundleResult<String> {
        let mut file = self.open()?;
        let Some(data) = elf::read_section(&mut file, name)
            .with_info(|_| format!("path: {:?}", self.path))?
        else {
            return Ok(String::new());
        };
        Ok(cstring_prefix(&data))
    }

    fn has_elf_magic(&self, file: &mut File) -> BundleResult<bool> {
        let mut magic = [0u8; 4];
        let read = read_at(file, 0, &mut magic)?;
        Ok(read == magic.len() && magic == [0x7f, b'E', b'L', b'F'])
    }

    fn has_iso_magic(&self, file: &mut File) -> BundleResult<bool> {
        let mut magic = [0u8; 5];
        let read = read_at(file, ISO_MAGIC_OFFSET, &mut magic)?;
        Ok(read == magic.len() && magic == *b"CD001")
    }
}

/// Read as many bytes as available at the given offset.
///
/// Short reads, including reads past the end of the file, are not an
/// error; the number of bytes actually read is returned.
fn read_at(file: &mut File, offset: u64, buffer: &mut [u8]) -> BundleResult<usize> {
    file.seek(SeekFrom::Start(offset))
        .whatever("unable to seek in AppImage")?;
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file
            .read(&mut buffer[filled..])
            .whatever("unable to read from AppImage")?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Decode embedded section text with C-string semantics.
///
/// Sections are zero-padded, so the content ends at the first NUL
/// byte; surrounding whitespace is stripped like the signing tools do.
fn cstring_prefix(data: &[u8]) -> String {
    let end = data.iter().position(|byte| *byte == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cstring_prefix() {
        assert_eq!(cstring_prefix(b"hello\0\0\0"), "hello");
        assert_eq!(cstring_prefix(b"  padded \n\0junk"), "padded");
        assert_eq!(cstring_prefix(b"\0\0\0"), "");
        assert_eq!(cstring_prefix(b""), "");
        assert_eq!(cstring_prefix(b"no terminator"), "no terminator");
    }
}
