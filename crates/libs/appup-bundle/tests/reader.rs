//! Tests against synthetic AppImage files.

use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};

use appup_bundle::{AppImage, AppImageType};

/// Byte pattern used for filler regions.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_temp(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::File::create(&path)
        .unwrap()
        .write_all(data)
        .unwrap();
    path
}

/// Build a 64-bit little-endian ELF with the AppImage type-2 magic and
/// the given sections at fixed file offsets.
fn build_type2(sections: &[(&str, u64, Vec<u8>)], min_len: u64) -> Vec<u8> {
    let mut shstrtab = vec![0u8];
    let mut name_offsets = Vec::new();
    let shstrtab_name_offset = shstrtab.len() as u32;
    shstrtab.extend(b".shstrtab\0");
    for (name, _, _) in sections {
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend(name.as_bytes());
        shstrtab.push(0);
    }

    let shstrtab_offset = 64u64;
    let data_end = sections
        .iter()
        .map(|(_, offset, data)| offset + data.len() as u64)
        .fold(shstrtab_offset + shstrtab.len() as u64, u64::max)
        .max(min_len);
    let shoff = (data_end + 7) & !7;
    let count = 2 + sections.len() as u16;

    let total = shoff as usize + 64 * count as usize;
    let mut image = pattern(total);

    // ELF header with the AppImage magic in the identification padding.
    image[..64].fill(0);
    image[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[4] = 2; // 64-bit
    image[5] = 1; // little endian
    image[6] = 1;
    image[8..11].copy_from_slice(b"AI\x02");
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // e_type
    image[18..20].copy_from_slice(&0x3eu16.to_le_bytes()); // e_machine
    image[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    image[40..48].copy_from_slice(&shoff.to_le_bytes()); // e_shoff
    image[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
    image[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
    image[60..62].copy_from_slice(&count.to_le_bytes()); // e_shnum
    image[62..64].copy_from_slice(&1u16.to_le_bytes()); // e_shstrndx

    let start = shstrtab_offset as usize;
    image[start..start + shstrtab.len()].copy_from_slice(&shstrtab);
    for (_, offset, data) in sections {
        let start = *offset as usize;
        image[start..start + data.len()].copy_from_slice(data);
    }

    let mut shdr = |index: usize, name: u32, offset: u64, size: u64| {
        let base = shoff as usize + 64 * index;
        image[base..base + 64].fill(0);
        image[base..base + 4].copy_from_slice(&name.to_le_bytes());
        image[base + 4..base + 8].copy_from_slice(&1u32.to_le_bytes()); // SHT_PROGBITS
        image[base + 24..base + 32].copy_from_slice(&offset.to_le_bytes());
        image[base + 32..base + 40].copy_from_slice(&size.to_le_bytes());
    };
    // Index 0 stays all zeros.
    shdr(
        1,
        shstrtab_name_offset,
        shstrtab_offset,
        shstrtab.len() as u64,
    );
    for (index, (_, offset, data)) in sections.iter().enumerate() {
        shdr(2 + index, name_offsets[index], *offset, data.len() as u64);
    }
    // The string table is SHT_STRTAB.
    let base = shoff as usize + 64;
    image[base + 4..base + 8].copy_from_slice(&3u32.to_le_bytes());

    image
}

/// Build a type-1 style file: AppImage magic plus the update
/// information string at its fixed offset.
fn build_type1(update_info: &str) -> Vec<u8> {
    let mut image = pattern(0x9000);
    image[..8].fill(0);
    image[8..11].copy_from_slice(b"AI\x01");
    let field = &mut image[0x8373..0x8373 + 512];
    field.fill(0);
    field[..update_info.len()].copy_from_slice(update_info.as_bytes());
    image
}

/// Pad section text to a fixed size with NUL bytes.
fn padded(text: &str, size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    data[..text.len()].copy_from_slice(text.as_bytes());
    data
}

#[test]
fn test_detects_type2_magic() {
    let dir = tempfile::tempdir().unwrap();
    let image = build_type2(&[], 9000);
    let path = write_temp(dir.path(), "t2.AppImage", &image);
    let detection = AppImage::new(&path).detect_type().unwrap();
    assert_eq!(detection.kind, AppImageType::Type2);
    assert!(!detection.legacy_magic);
}

#[test]
fn test_detects_type1_magic() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp(dir.path(), "t1.AppImage", &build_type1("zsync|u"));
    let detection = AppImage::new(&path).detect_type().unwrap();
    assert_eq!(detection.kind, AppImageType::Type1);
    assert!(!detection.legacy_magic);
}

#[test]
fn test_detects_legacy_type1_via_elf_and_iso_magic() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = pattern(40_000);
    image[..8].fill(0);
    image[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[8..11].fill(0); // no AppImage magic
    image[32769..32774].copy_from_slice(b"CD001");
    let path = write_temp(dir.path(), "legacy.AppImage", &image);
    let detection = AppImage::new(&path).detect_type().unwrap();
    assert_eq!(detection.kind, AppImageType::Type1);
    assert!(detection.legacy_magic);
}

#[test]
fn test_rejects_unknown_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp(dir.path(), "random.bin", &pattern(40_000));
    let error = AppImage::new(&path).detect_type().unwrap_err();
    assert!(format!("{error:?}").contains("unknown AppImage type"));
}

#[test]
fn test_open_failure_names_the_path() {
    let error = AppImage::new("/does/not/exist.AppImage")
        .detect_type()
        .unwrap_err();
    assert!(format!("{error:?}").contains("exist.AppImage"));
}

#[test]
fn test_type1_update_info() {
    let dir = tempfile::tempdir().unwrap();
    let hint = "gh-releases-zsync|me|app|latest|App-*-x86_64.AppImage";
    let path = write_temp(dir.path(), "t1.AppImage", &build_type1(hint));
    assert_eq!(AppImage::new(&path).raw_update_info().unwrap(), hint);
}

#[test]
fn test_type2_update_info() {
    let dir = tempfile::tempdir().unwrap();
    let hint = "zsync|https://example.com/app.zsync";
    let image = build_type2(&[(".upd_info", 1024, padded(hint, 512))], 9000);
    let path = write_temp(dir.path(), "t2.AppImage", &image);
    assert_eq!(AppImage::new(&path).raw_update_info().unwrap(), hint);
}

#[test]
fn test_missing_section_yields_empty_string() {
    let dir = tempfile::tempdir().unwrap();
    let image = build_type2(&[], 9000);
    let path = write_temp(dir.path(), "t2.AppImage", &image);
    let bundle = AppImage::new(&path);
    assert_eq!(bundle.raw_update_info().unwrap(), "");
    assert_eq!(bundle.signature().unwrap(), "");
    assert_eq!(bundle.signing_key().unwrap(), "");
}

#[test]
fn test_zero_filled_section_yields_empty_string() {
    let dir = tempfile::tempdir().unwrap();
    let image = build_type2(&[(".sha256_sig", 1024, vec![0u8; 2048])], 9000);
    let path = write_temp(dir.path(), "t2.AppImage", &image);
    assert_eq!(AppImage::new(&path).signature().unwrap(), "");
}

#[test]
fn test_signature_not_supported_for_type1() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp(dir.path(), "t1.AppImage", &build_type1(""));
    let error = AppImage::new(&path).signature().unwrap_err();
    assert!(format!("{error:?}").contains("not supported for type 1"));
}

#[test]
fn test_signature_and_key_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let signature = "-----BEGIN PGP SIGNATURE-----\nAAAA\n-----END PGP SIGNATURE-----";
    let key = "-----BEGIN PGP PUBLIC KEY BLOCK-----\nBBBB\n-----END PGP PUBLIC KEY BLOCK-----";
    let image = build_type2(
        &[
            (".sha256_sig", 1024, padded(signature, 2048)),
            (".sig_key", 4096, padded(key, 4096)),
        ],
        12_000,
    );
    let path = write_temp(dir.path(), "t2.AppImage", &image);
    let bundle = AppImage::new(&path);
    assert_eq!(bundle.signature().unwrap(), signature);
    assert_eq!(bundle.signing_key().unwrap(), key);
}

#[test]
fn test_canonical_hash_zeroes_signature_sections() {
    let dir = tempfile::tempdir().unwrap();
    // The signature section intentionally spans the first chunk
    // boundary, the key section starts exactly on one.
    let image = build_type2(
        &[
            (".sha256_sig", 4090, pattern(2048)),
            (".sig_key", 8192, pattern(4096)),
        ],
        16_000,
    );
    let path = write_temp(dir.path(), "t2.AppImage", &image);

    let mut zeroed = image.clone();
    zeroed[4090..4090 + 2048].fill(0);
    zeroed[8192..8192 + 4096].fill(0);
    let expected = hex::encode(Sha256::digest(&zeroed));

    assert_eq!(AppImage::new(&path).canonical_hash().unwrap(), expected);
}

#[test]
fn test_canonical_hash_of_zeroed_sections_is_plain_sha256() {
    let dir = tempfile::tempdir().unwrap();
    let image = build_type2(
        &[
            (".sha256_sig", 4090, vec![0u8; 2048]),
            (".sig_key", 8192, vec![0u8; 4096]),
        ],
        16_000,
    );
    let path = write_temp(dir.path(), "t2.AppImage", &image);
    assert_eq!(
        AppImage::new(&path).canonical_hash().unwrap(),
        hex::encode(Sha256::digest(&image)),
    );
}

#[test]
fn test_canonical_hash_without_sections_is_plain_sha256() {
    let dir = tempfile::tempdir().unwrap();
    let image = build_type2(&[], 9000);
    let path = write_temp(dir.path(), "t2.AppImage", &image);
    assert_eq!(
        AppImage::new(&path).canonical_hash().unwrap(),
        hex::encode(Sha256::digest(&image)),
    );
}

#[test]
fn test_reopening_yields_identical_results() {
    let dir = tempfile::tempdir().unwrap();
    let hint = "zsync|https://example.com/app.zsync";
    let image = build_type2(
        &[
            (".upd_info", 1024, padded(hint, 512)),
            (".sha256_sig", 4090, pattern(2048)),
            (".sig_key", 8192, pattern(4096)),
        ],
        16_000,
    );
    let path = write_temp(dir.path(), "t2.AppImage", &image);
    let bundle = AppImage::new(&path);
    assert_eq!(
        bundle.raw_update_info().unwrap(),
        bundle.raw_update_info().unwrap()
    );
    assert_eq!(bundle.signature().unwrap(), bundle.signature().unwrap());
    assert_eq!(
        bundle.canonical_hash().unwrap(),
        bundle.canonical_hash().unwrap()
    );
}
