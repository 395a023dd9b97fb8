//! Minimal ELF section-table reader.
//!
//! AppImage metadata lives in named sections of the embedded runtime
//! executable. We only need to locate sections by name through the
//! section header table and the section-name string table; both ELF
//! classes and both byte orders are handled.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use reportify::{bail, ResultExt};

use crate::BundleResult;

/// Special section index signalling extended section numbering.
const SHN_XINDEX: u16 = 0xffff;
/// Section type without file contents.
const SHT_NOBITS: u32 = 8;

/// Upper bound on the size of sections we are willing to read.
const SECTION_SIZE_LIMIT: u64 = 16 * 1024 * 1024;
/// Upper bound on the number of section headers we are willing to walk.
const SECTION_COUNT_LIMIT: u64 = 1 << 20;

/// File region occupied by a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRegion {
    /// Offset of the section's first byte.
    pub offset: u64,
    /// Size of the section in bytes.
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct Encoding {
    class64: bool,
    big_endian: bool,
}

impl Encoding {
    fn u16(&self, bytes: &[u8]) -> u16 {
        let bytes = bytes[..2].try_into().unwrap();
        if self.big_endian {
            u16::from_be_bytes(bytes)
        } else {
            u16::from_le_bytes(bytes)
        }
    }

    fn u32(&self, bytes: &[u8]) -> u32 {
        let bytes = bytes[..4].try_into().unwrap();
        if self.big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        }
    }

    fn u64(&self, bytes: &[u8]) -> u64 {
        let bytes = bytes[..8].try_into().unwrap();
        if self.big_endian {
            u64::from_be_bytes(bytes)
        } else {
            u64::from_le_bytes(bytes)
        }
    }
}

/// Section header fields relevant for lookups.
#[derive(Debug, Clone, Copy)]
struct SectionHeader {
    name_offset: u32,
    section_type: u32,
    offset: u64,
    size: u64,
    link: u32,
}

/// Locate a section by name.
///
/// Returns `None` when the file is not an ELF image or has no section
/// with the given name. Malformed section tables are an error.
pub fn find_section(file: &mut File, name: &str) -> BundleResult<Option<SectionRegion>> {
    let Some(table) = SectionTable::open(file)? else {
        return Ok(None);
    };
    table.find(file, name)
}

/// Read the contents of a section by name.
///
/// Returns `None` under the same conditions as [`find_section`].
pub fn read_section(file: &mut File, name: &str) -> BundleResult<Option<Vec<u8>>> {
    let Some(region) = find_section(file, name)? else {
        return Ok(None);
    };
    if region.size > SECTION_SIZE_LIMIT {
        bail!("section {name} is implausibly large ({} bytes)", region.size);
    }
    Ok(Some(read_region(file, region)?))
}

struct SectionTable {
    encoding: Encoding,
    offset: u64,
    entry_size: u64,
    count: u64,
    string_table: SectionRegion,
}

impl SectionTable {
    /// Parse the ELF header and locate the section header table.
    fn open(file: &mut File) -> BundleResult<Option<Self>> {
        let mut ident = [0u8; 16];
        file.seek(SeekFrom::Start(0))
            .whatever("unable to seek in ELF image")?;
        if !read_full(file, &mut ident)? || ident[..4] != [0x7f, b'E', b'L', b'F'] {
            return Ok(None);
        }
        let encoding = Encoding {
            class64: match ident[4] {
                1 => false,
                2 => true,
                class => bail!("unsupported ELF class {class}"),
            },
            big_endian: match ident[5] {
                1 => false,
                2 => true,
                encoding => bail!("unsupported ELF data encoding {encoding}"),
            },
        };
        let mut rest = [0u8; 48];
        let rest = &mut rest[..if encoding.class64 { 48 } else { 36 }];
        if !read_full(file, rest)? {
            bail!("truncated ELF header");
        }
        // Field offsets below are relative to the end of `e_ident`.
        let (section_offset, entry_size, count, string_index) = if encoding.class64 {
            (
                encoding.u64(&rest[24..]),
                u64::from(encoding.u16(&rest[42..])),
                u64::from(encoding.u16(&rest[44..])),
                encoding.u16(&rest[46..]),
            )
        } else {
            (
                u64::from(encoding.u32(&rest[16..])),
                u64::from(encoding.u16(&rest[30..])),
                u64::from(encoding.u16(&rest[32..])),
                encoding.u16(&rest[34..]),
            )
        };
        if section_offset == 0 {
            return Ok(None);
        }
        let minimum_entry_size = if encoding.class64 { 64 } else { 40 };
        if entry_size < minimum_entry_size {
            bail!("invalid section header entry size {entry_size}");
        }
        let mut table = Self {
            encoding,
            offset: section_offset,
            entry_size,
            count,
            string_table: SectionRegion { offset: 0, size: 0 },
        };
        // With extended numbering, the real values live in the first
        // section header.
        let initial = table.header(file, 0)?;
        if table.count == 0 {
            table.count = initial.size;
        }
        if table.count > SECTION_COUNT_LIMIT {
            bail!("implausible section count {}", table.count);
        }
        let string_index = if string_index == SHN_XINDEX {
            u64::from(initial.link)
        } else {
            u64::from(string_index)
        };
        if string_index == 0 {
            // No section names, nothing can be looked up.
            return Ok(None);
        }
        if string_index >= table.count {
            bail!("invalid section name string table index {string_index}");
        }
        let strings = table.header(file, string_index)?;
        if strings.size > SECTION_SIZE_LIMIT {
            bail!("implausibly large section name string table");
        }
        table.string_table = SectionRegion {
            offset: strings.offset,
            size: strings.size,
        };
        Ok(Some(table))
    }

    fn header(&self, file: &mut File, index: u64) -> BundleResult<SectionHeader> {
        let mut entry = [0u8; 64];
        let entry = &mut entry[..if self.encoding.class64 { 64 } else { 40 }];
        file.seek(SeekFrom::Start(self.offset + index * self.entry_size))
            .whatever("unable to seek to section header")?;
        if !read_full(file, entry)? {
            bail!("truncated section header table");
        }
        let encoding = self.encoding;
        Ok(if encoding.class64 {
            SectionHeader {
                name_offset: encoding.u32(&entry[0..]),
                section_type: encoding.u32(&entry[4..]),
                offset: encoding.u64(&entry[24..]),
                size: encoding.u64(&entry[32..]),
                link: encoding.u32(&entry[40..]),
            }
        } else {
            SectionHeader {
                name_offset: encoding.u32(&entry[0..]),
                section_type: encoding.u32(&entry[4..]),
                offset: u64::from(encoding.u32(&entry[16..])),
                size: u64::from(encoding.u32(&entry[20..])),
                link: encoding.u32(&entry[24..]),
            }
        })
    }

    fn find(&self, file: &mut File, name: &str) -> BundleResult<Option<SectionRegion>> {
        let strings = read_region(file, self.string_table)?;
        for index in 1..self.count {
            let header = self.header(file, index)?;
            if section_name(&strings, header.name_offset) != Some(name) {
                continue;
            }
            if header.section_type == SHT_NOBITS {
                // The section occupies no file bytes.
                return Ok(None);
            }
            return Ok(Some(SectionRegion {
                offset: header.offset,
                size: header.size,
            }));
        }
        Ok(None)
    }
}

/// Resolve a section name from the string table.
fn section_name(strings: &[u8], offset: u32) -> Option<&str> {
    let start = strings.get(offset as usize..)?;
    let end = start.iter().position(|byte| *byte == 0)?;
    std::str::from_utf8(&start[..end]).ok()
}

fn read_region(file: &mut File, region: SectionRegion) -> BundleResult<Vec<u8>> {
    let mut data = vec![0u8; region.size as usize];
    file.seek(SeekFrom::Start(region.offset))
        .whatever("unable to seek to section")?;
    if !read_full(file, &mut data)? {
        bail!("section extends past the end of the file");
    }
    Ok(data)
}

/// Fill the whole buffer, reporting whether enough bytes were left.
fn read_full(file: &mut File, buffer: &mut [u8]) -> BundleResult<bool> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file
            .read(&mut buffer[filled..])
            .whatever("unable to read from ELF image")?;
        if read == 0 {
            return Ok(false);
        }
        filled += read;
    }
    Ok(true)
}
