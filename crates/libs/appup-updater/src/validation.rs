//! Signature comparison between the old and the new bundle.

use std::collections::HashSet;

use appup_bundle::{AppImage, AppImageType};
use appup_signing::{ResultKind, SignatureValidationResult, SignatureValidator};

/// Outcome of validating an update's signatures.
///
/// Outcomes are classified through [`ValidationOutcome::is_warning`]
/// and [`ValidationOutcome::is_error`] instead of numeric thresholds;
/// everything that is neither a warning nor an error passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// All signatures verified against matching keys.
    Passed,
    /// Verification succeeded but produced warnings.
    Warning,
    /// Neither bundle is signed.
    NotSigned,
    /// No OpenPGP engine is available.
    ///
    /// Kept for interface compatibility; the in-process verifier
    /// never produces it.
    GpgMissing,
    /// The new file is unknown or could not be inspected.
    Failed,
    /// The bundles are signed with unrelated keys.
    KeyChanged,
    /// A call to the OpenPGP engine failed.
    ///
    /// Kept for interface compatibility; the in-process verifier
    /// never produces it.
    GpgCallFailed,
    /// A private working directory could not be created.
    ///
    /// Kept for interface compatibility; the in-process verifier
    /// never produces it.
    TempDirCreationFailed,
    /// The old bundle is signed but the new one no longer is.
    NoLongerSigned,
    /// At least one signature failed to verify.
    BadSignature,
}

impl ValidationOutcome {
    /// Whether the outcome is a warning.
    ///
    /// Warnings leave the decision to the user; errors should make the
    /// caller restore the original file.
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            ValidationOutcome::Warning
                | ValidationOutcome::NotSigned
                | ValidationOutcome::GpgMissing
        )
    }

    /// Whether the outcome is an error.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ValidationOutcome::Failed
                | ValidationOutcome::KeyChanged
                | ValidationOutcome::GpgCallFailed
                | ValidationOutcome::TempDirCreationFailed
                | ValidationOutcome::NoLongerSigned
                | ValidationOutcome::BadSignature
        )
    }

    /// Human-readable summary of the outcome.
    pub fn message(self) -> &'static str {
        match self {
            ValidationOutcome::Passed => "Signature validation successful",
            ValidationOutcome::Warning => "Signature validation warning",
            ValidationOutcome::NotSigned => "AppImage not signed",
            ValidationOutcome::GpgMissing => "no OpenPGP engine available",
            ValidationOutcome::Failed => "Signature validation failed",
            ValidationOutcome::KeyChanged => "the key used for signing the AppImage changed",
            ValidationOutcome::GpgCallFailed => "call to the OpenPGP engine failed",
            ValidationOutcome::TempDirCreationFailed => "failed to create temporary directory",
            ValidationOutcome::NoLongerSigned => "AppImage no longer comes with a signature",
            ValidationOutcome::BadSignature => "bad signature",
        }
    }
}

/// Compare the signatures of an old and a new bundle.
///
/// Both paths must point to existing files; the old bundle may be the
/// `.zs-old` backup when the new file took the seed's name.
pub fn classify_bundle_pair(old: &AppImage, new: &AppImage) -> ValidationOutcome {
    let old_signed = is_signed(old);
    let new_signed = is_signed(new);
    match (old_signed, new_signed) {
        (false, false) => ValidationOutcome::NotSigned,
        (true, false) => ValidationOutcome::NoLongerSigned,
        (false, true) => {
            // Gaining a signature is an improvement; there is nothing
            // to compare the new key against.
            single_outcome(&SignatureValidator::validate(new))
        }
        (true, true) => {
            let old_result = SignatureValidator::validate(old);
            let new_result = SignatureValidator::validate(new);
            if old_result.kind() == ResultKind::Error || new_result.kind() == ResultKind::Error {
                return ValidationOutcome::BadSignature;
            }
            let old_keys: HashSet<&String> = old_result.key_fingerprints().iter().collect();
            let shared_key = new_result
                .key_fingerprints()
                .iter()
                .any(|fingerprint| old_keys.contains(fingerprint));
            if !shared_key {
                return ValidationOutcome::KeyChanged;
            }
            if old_result.kind() == ResultKind::Warning
                || new_result.kind() == ResultKind::Warning
            {
                ValidationOutcome::Warning
            } else {
                ValidationOutcome::Passed
            }
        }
    }
}

fn single_outcome(result: &SignatureValidationResult) -> ValidationOutcome {
    match result.kind() {
        ResultKind::Success => ValidationOutcome::Passed,
        ResultKind::Warning => ValidationOutcome::Warning,
        ResultKind::Error => ValidationOutcome::BadSignature,
    }
}

/// Whether the bundle carries a signature.
///
/// Type-1 bundles and unreadable files count as unsigned.
fn is_signed(bundle: &AppImage) -> bool {
    matches!(bundle.image_type(), Ok(AppImageType::Type2))
        && bundle
            .signature()
            .map_or(false, |signature| !signature.is_empty())
}
