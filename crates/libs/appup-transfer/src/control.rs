//! Model of the zsync control file header.
//!
//! A control file starts with `Key: Value` header lines terminated by
//! a blank line; the block checksum table follows in binary form. Only
//! the headers are needed here.

use thiserror::Error;

/// Error decoding a control file.
#[derive(Debug, Error)]
pub enum ControlFileError {
    #[error("control file has no header terminator")]
    MissingTerminator,
    #[error("control file is missing the `{0}` header")]
    MissingHeader(&'static str),
    #[error("control file has an invalid `{0}` header")]
    InvalidHeader(&'static str),
}

/// Parsed control file headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFile {
    /// Version of the producing tool.
    pub version: Option<String>,
    /// Name of the remote file.
    pub filename: String,
    /// Download URL of the remote file, possibly relative to the
    /// control file's own URL.
    pub url: Option<String>,
    /// Block size used for the checksum table.
    pub blocksize: u32,
    /// Size of the remote file in bytes.
    pub length: u64,
    /// SHA-1 of the remote file, lowercase hex.
    pub sha1: String,
}

impl ControlFile {
    /// Parse the header section of a control file.
    pub fn parse(data: &[u8]) -> Result<Self, ControlFileError> {
        let end = data
            .windows(2)
            .position(|window| window == b"\n\n")
            .ok_or(ControlFileError::MissingTerminator)?;
        let headers = String::from_utf8_lossy(&data[..end]);

        let mut version = None;
        let mut filename = None;
        let mut url = None;
        let mut blocksize = None;
        let mut length = None;
        let mut sha1 = None;
        for line in headers.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key {
                "zsync" => version = Some(value.to_owned()),
                "Filename" => filename = Some(value.to_owned()),
                "URL" => url = Some(value.to_owned()),
                "Blocksize" => {
                    blocksize = Some(
                        value
                            .parse()
                            .map_err(|_| ControlFileError::InvalidHeader("Blocksize"))?,
                    )
                }
                "Length" => {
                    length = Some(
                        value
                            .parse()
                            .map_err(|_| ControlFileError::InvalidHeader("Length"))?,
                    )
                }
                "SHA-1" => sha1 = Some(value.to_ascii_lowercase()),
                _ => {}
            }
        }
        Ok(Self {
            version,
            filename: filename.ok_or(ControlFileError::MissingHeader("Filename"))?,
            url,
            blocksize: blocksize.ok_or(ControlFileError::MissingHeader("Blocksize"))?,
            length: length.ok_or(ControlFileError::MissingHeader("Length"))?,
            sha1: sha1.ok_or(ControlFileError::MissingHeader("SHA-1"))?,
        })
    }
}
