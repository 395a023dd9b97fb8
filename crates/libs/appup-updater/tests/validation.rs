//! Signature validation overlay tests against signed fixtures.

use std::path::{Path, PathBuf};

use appup_bundle::AppImage;
use appup_updater::{classify_bundle_pair, Updater, ValidationOutcome};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn bundle(name: &str) -> AppImage {
    AppImage::new(fixture(name))
}

#[test]
fn test_same_key_passes() {
    assert_eq!(
        classify_bundle_pair(&bundle("signed-v1-key1.appimage"), &bundle("signed-v2-key1.appimage")),
        ValidationOutcome::Passed,
    );
}

#[test]
fn test_changed_key_is_detected() {
    let outcome = classify_bundle_pair(
        &bundle("signed-v1-key1.appimage"),
        &bundle("signed-v2-key2.appimage"),
    );
    assert_eq!(outcome, ValidationOutcome::KeyChanged);
    assert!(outcome.is_error());
}

#[test]
fn test_unsigned_bundles_are_reported() {
    let outcome =
        classify_bundle_pair(&bundle("unsigned-v1.appimage"), &bundle("unsigned-v2.appimage"));
    assert_eq!(outcome, ValidationOutcome::NotSigned);
    assert!(outcome.is_warning());
    assert!(!outcome.is_error());
}

#[test]
fn test_dropping_the_signature_is_an_error() {
    let outcome =
        classify_bundle_pair(&bundle("signed-v1-key1.appimage"), &bundle("unsigned-v2.appimage"));
    assert_eq!(outcome, ValidationOutcome::NoLongerSigned);
    assert!(outcome.is_error());
}

#[test]
fn test_gaining_a_signature_passes() {
    assert_eq!(
        classify_bundle_pair(&bundle("unsigned-v1.appimage"), &bundle("signed-v2-key1.appimage")),
        ValidationOutcome::Passed,
    );
}

#[test]
fn test_tampered_new_bundle_is_a_bad_signature() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = std::fs::read(fixture("signed-v2-key1.appimage")).unwrap();
    // Flip a payload byte outside the signature and key sections.
    image[2000] ^= 0xff;
    let tampered = dir.path().join("tampered.appimage");
    std::fs::write(&tampered, image).unwrap();

    let outcome =
        classify_bundle_pair(&bundle("signed-v1-key1.appimage"), &AppImage::new(&tampered));
    assert_eq!(outcome, ValidationOutcome::BadSignature);
    assert!(outcome.is_error());
}

#[test]
fn test_validation_without_a_new_file_fails() {
    let updater = Updater::new(fixture("signed-v1-key1.appimage"), false).unwrap();
    let outcome = updater.validate_signature();
    assert_eq!(outcome, ValidationOutcome::Failed);
    let mut saw_message = false;
    while let Some(message) = updater.next_status_message() {
        saw_message |= message.contains("Signature validation failed");
    }
    assert!(saw_message);
}
