#![forbid(unsafe_code)]

//! Shared HTTP agent for all components that talk to remote servers.
//!
//! The agent is created once per process. TLS roots come from the CA
//! bundle discovered via [`ca_bundle_path`]; without a usable bundle we
//! fall back to the agent's built-in roots.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use tracing::warn;
use ureq::tls::{Certificate, RootCerts, TlsConfig};
use ureq::Agent;

/// CA bundle locations probed when `SSL_CERT_FILE` is not set.
///
/// Compiled from the locations used by common Linux distributions.
const CA_BUNDLE_PATHS: &[&str] = &[
    "/etc/pki/tls/cacert.pem",
    "/etc/pki/tls/cert.pem",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/ssl/cert.pem",
    "/etc/ssl/certs/ca-certificates.crt",
    "/usr/local/share/certs/ca-root-nss.crt",
    "/usr/share/ssl/certs/ca-bundle.crt",
];

/// Find a CA certificate bundle on the local system.
///
/// A file named by the `SSL_CERT_FILE` environment variable takes
/// precedence over the probed distro paths.
pub fn ca_bundle_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("SSL_CERT_FILE") {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Some(path);
        }
        warn!("SSL_CERT_FILE does not point to a file, ignoring");
    }
    CA_BUNDLE_PATHS
        .iter()
        .map(Path::new)
        .find(|path| path.is_file())
        .map(Path::to_path_buf)
}

/// The process-wide HTTP agent.
pub fn agent() -> Agent {
    static AGENT: OnceLock<Agent> = OnceLock::new();
    AGENT.get_or_init(build_agent).clone()
}

fn build_agent() -> Agent {
    let mut config = Agent::config_builder().timeout_global(Some(Duration::from_secs(60)));
    if let Some(bundle) = ca_bundle_path() {
        match load_root_certs(&bundle) {
            Ok(certs) if !certs.is_empty() => {
                config = config.tls_config(
                    TlsConfig::builder()
                        .root_certs(RootCerts::new_with_certs(&certs))
                        .build(),
                );
            }
            Ok(_) => warn!("CA bundle {bundle:?} contains no certificates"),
            Err(error) => warn!("unable to load CA bundle {bundle:?}: {error}"),
        }
    }
    config.build().new_agent()
}

/// Parse all certificates of a PEM bundle.
fn load_root_certs(path: &Path) -> Result<Vec<Certificate<'static>>, std::io::Error> {
    let pem = std::fs::read(path)?;
    // The roots must outlive the agent; the bundle is loaded exactly
    // once for the lifetime of the process.
    let pem: &'static [u8] = Box::leak(pem.into_boxed_slice());
    let mut certs = Vec::new();
    for block in pem_blocks(pem) {
        match Certificate::from_pem(block) {
            Ok(cert) => certs.push(cert),
            Err(error) => warn!("skipping unparsable certificate in {path:?}: {error}"),
        }
    }
    Ok(certs)
}

/// Split a PEM bundle into individual `BEGIN`/`END` blocks.
fn pem_blocks(pem: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    const BEGIN: &[u8] = b"-----BEGIN CERTIFICATE-----";
    const END: &[u8] = b"-----END CERTIFICATE-----";
    let mut rest = pem;
    std::iter::from_fn(move || {
        let start = find(rest, BEGIN)?;
        let end = find(&rest[start..], END)? + start + END.len();
        let block = &rest[start..end];
        rest = &rest[end..];
        Some(block)
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
