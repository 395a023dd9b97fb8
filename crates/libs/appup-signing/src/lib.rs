#![forbid(unsafe_code)]

//! OpenPGP signature validation for AppImage files.
//!
//! The detached signature embedded in an AppImage covers the bundle's
//! canonical hash. Verification happens entirely in process against
//! the signing key that is likewise embedded in the bundle; no keyring
//! and no external gpg engine are involved.

use chrono::Utc;
use pgp::composed::{Deserializable, SignedPublicKey, StandaloneSignature};
use pgp::types::PublicKeyTrait;
use tracing::debug;

use appup_bundle::AppImage;

/// Coarse classification of a validation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Success,
    Warning,
    Error,
}

/// Outcome of validating a single bundle's signature.
#[derive(Debug, Clone)]
pub struct SignatureValidationResult {
    kind: ResultKind,
    message: String,
    key_fingerprints: Vec<String>,
}

impl SignatureValidationResult {
    fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::Error,
            message: message.into(),
            key_fingerprints: Vec::new(),
        }
    }

    /// Classification of the result.
    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    /// Human-readable summary of the checks performed.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Fingerprints of the keys involved, uppercase hex.
    pub fn key_fingerprints(&self) -> &[String] {
        &self.key_fingerprints
    }
}

/// Stateless validator for embedded AppImage signatures.
pub struct SignatureValidator;

impl SignatureValidator {
    /// Validate the embedded signature of the given bundle.
    ///
    /// Problems never escape as errors; they are folded into the
    /// returned classification so callers can apply their own policy.
    pub fn validate(bundle: &AppImage) -> SignatureValidationResult {
        match Self::try_validate(bundle) {
            Ok(result) => result,
            Err(message) => SignatureValidationResult::error(message),
        }
    }

    fn try_validate(bundle: &AppImage) -> Result<SignatureValidationResult, String> {
        let signature_text = bundle
            .signature()
            .map_err(|error| format!("unable to read signature: {error:?}"))?;
        if signature_text.is_empty() {
            return Err("AppImage is not signed".to_owned());
        }
        let key_text = bundle
            .signing_key()
            .map_err(|error| format!("unable to read signing key: {error:?}"))?;
        if key_text.is_empty() {
            return Err("AppImage does not embed a signing key".to_owned());
        }
        let (key, _) = SignedPublicKey::from_string(&key_text)
            .map_err(|error| format!("failed to import signing key: {error}"))?;
        let signature = parse_signature(&signature_text)?;
        let digest = bundle
            .canonical_hash()
            .map_err(|error| format!("unable to compute canonical hash: {error:?}"))?;

        let fingerprint = hex::encode_upper(key.fingerprint().as_bytes());
        let mut kind = ResultKind::Success;
        let mut conditions = Vec::new();

        if !issuer_matches(&signature, &key) {
            // The signature was made by some other key; without it we
            // cannot judge the signature itself.
            kind = ResultKind::Warning;
            conditions.push("key missing");
        } else if let Err(error) = verify_with_any(&signature, &key, digest.as_bytes()) {
            debug!("signature verification failed: {error}");
            kind = ResultKind::Error;
            conditions.push("bad signature");
        } else if key.expires_at().is_some_and(|expiry| expiry < Utc::now()) {
            // An expired key may happen any time with AppImages; as
            // long as the signature itself is valid this is a warning.
            kind = ResultKind::Warning;
            conditions.push("key expired");
        }

        let status = match kind {
            ResultKind::Success => "OK",
            ResultKind::Warning => "warning",
            ResultKind::Error => "error",
        };
        let mut message =
            format!("Signature checked for key with fingerprint {fingerprint}: {status}");
        if !conditions.is_empty() {
            message.push_str(&format!(" ({})", conditions.join(", ")));
        }
        message.push('\n');
        message.push_str(match kind {
            ResultKind::Success => "Validation successful",
            ResultKind::Warning => "Validation resulted in warning state",
            ResultKind::Error => "Validation failed",
        });

        Ok(SignatureValidationResult {
            kind,
            message,
            key_fingerprints: vec![fingerprint],
        })
    }
}

/// Parse an armored or binary detached signature.
fn parse_signature(text: &str) -> Result<StandaloneSignature, String> {
    if text.contains("-----BEGIN PGP SIGNATURE-----") {
        StandaloneSignature::from_string(text)
            .map(|(signature, _)| signature)
            .map_err(|error| format!("failed to parse signature: {error}"))
    } else {
        StandaloneSignature::from_bytes(std::io::Cursor::new(text.as_bytes()))
            .map_err(|error| format!("failed to parse signature: {error}"))
    }
}

/// Check whether the signature claims to be made by the given key or
/// one of its subkeys.
///
/// Signatures without an issuer packet are accepted; verification
/// decides their fate.
fn issuer_matches(signature: &StandaloneSignature, key: &SignedPublicKey) -> bool {
    let issuers = signature.signature.issuer();
    if issuers.is_empty() {
        return true;
    }
    issuers.iter().any(|issuer| {
        **issuer == key.key_id()
            || key
                .public_subkeys
                .iter()
                .any(|subkey| subkey.key_id() == **issuer)
    })
}

/// Verify the signature against the primary key or any subkey.
fn verify_with_any(
    signature: &StandaloneSignature,
    key: &SignedPublicKey,
    data: &[u8],
) -> Result<(), String> {
    match signature.verify(key, data) {
        Ok(()) => Ok(()),
        Err(primary_error) => {
            for subkey in &key.public_subkeys {
                if signature.verify(subkey, data).is_ok() {
                    return Ok(());
                }
            }
            Err(primary_error.to_string())
        }
    }
}
