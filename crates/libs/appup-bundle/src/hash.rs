//! Canonical hashing with skipped byte regions.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use reportify::ResultExt;
use sha2::{Digest, Sha256};

use crate::elf::SectionRegion;
use crate::BundleResult;

/// Chunk size used for streaming the file.
const CHUNK_SIZE: usize = 4096;

/// Hash the entire file, replacing the given regions with zeros.
///
/// The file is streamed in fixed-size chunks; a region may begin and
/// end anywhere, including in the middle of a chunk, across chunk
/// boundaries, or at the end of the file. Offsets are preserved, only
/// the bytes are replaced, so the digest matches hashing a copy of the
/// file with the regions pre-zeroed.
pub(crate) fn hash_with_skip_regions(
    file: &mut File,
    regions: &[SectionRegion],
) -> BundleResult<String> {
    file.seek(SeekFrom::Start(0))
        .whatever("unable to seek in AppImage")?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut position = 0u64;
    loop {
        let read = read_chunk(file, &mut buffer)?;
        if read == 0 {
            break;
        }
        let chunk = &mut buffer[..read];
        for region in regions {
            zero_overlap(chunk, position, region);
        }
        hasher.update(&chunk[..]);
        position += read as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Zero the bytes of `chunk` covered by `region`.
fn zero_overlap(chunk: &mut [u8], chunk_start: u64, region: &SectionRegion) {
    let chunk_end = chunk_start + chunk.len() as u64;
    let region_end = region.offset.saturating_add(region.size);
    let start = region.offset.max(chunk_start);
    let end = region_end.min(chunk_end);
    if start < end {
        chunk[(start - chunk_start) as usize..(end - chunk_start) as usize].fill(0);
    }
}

/// Fill the buffer as far as the file allows.
fn read_chunk(file: &mut File, buffer: &mut [u8]) -> BundleResult<usize> {
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
