#![forbid(unsafe_code)]

//! Parsing and resolution of AppImage update information.
//!
//! Update information is a pipe-delimited hint embedded in an
//! AppImage, identifying where newer versions can be found. Parsing
//! yields a typed variant; [`UpdateInfo::build_url`] resolves the
//! variant to the URL of a zsync control file, contacting the
//! respective release API where necessary.

use reportify::{bail, Report};

mod github;
mod pattern;
mod pling;

reportify::new_whatever_type! {
    /// Invalid update information or failure to resolve it.
    UpdateInfoError
}

/// Result with [`UpdateInfoError`] as error type.
pub type UpdateInfoResult<T> = Result<T, Report<UpdateInfoError>>;

/// Callback receiving one human-readable line per significant
/// resolution step.
pub type StatusCallback<'c> = &'c mut dyn FnMut(String);

/// Typed update information variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateInfo {
    /// A complete zsync control file URL.
    GenericZsync {
        url: String,
    },
    /// Resolve the control file through the GitHub releases API.
    GitHubReleases {
        user: String,
        repo: String,
        tag: String,
        file_glob: String,
    },
    /// Resolve the control file through the Pling OCS API.
    PlingV1 {
        product_id: String,
        file_glob: String,
    },
}

impl UpdateInfo {
    /// Parse a raw update information string.
    ///
    /// The hint consists of a type tag followed by a fixed number of
    /// `|`-separated parameters; any deviation is an error.
    pub fn parse(raw: &str) -> UpdateInfoResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("no update information present");
        }
        let tokens: Vec<&str> = raw.split('|').collect();
        match tokens[0] {
            "zsync" => {
                expect_parameter_count(&tokens, 2)?;
                Ok(UpdateInfo::GenericZsync {
                    url: tokens[1].to_owned(),
                })
            }
            "gh-releases-zsync" => {
                expect_parameter_count(&tokens, 5)?;
                Ok(UpdateInfo::GitHubReleases {
                    user: tokens[1].to_owned(),
                    repo: tokens[2].to_owned(),
                    tag: tokens[3].to_owned(),
                    file_glob: tokens[4].to_owned(),
                })
            }
            "pling-v1-zsync" => {
                expect_parameter_count(&tokens, 3)?;
                Ok(UpdateInfo::PlingV1 {
                    product_id: tokens[1].to_owned(),
                    file_glob: tokens[2].to_owned(),
                })
            }
            tag => bail!("unknown update information type: {tag}"),
        }
    }

    /// Human-readable description of the variant.
    pub fn description(&self) -> &'static str {
        match self {
            UpdateInfo::GenericZsync { .. } => "Generic ZSync URL",
            UpdateInfo::GitHubReleases { .. } => "ZSync via GitHub Releases",
            UpdateInfo::PlingV1 { .. } => "ZSync via OCS (Pling)",
        }
    }

    /// Resolve the variant to the URL of a zsync control file.
    ///
    /// Significant steps are reported through `on_status`.
    pub fn build_url(&self, on_status: StatusCallback) -> UpdateInfoResult<String> {
        match self {
            UpdateInfo::GenericZsync { url } => Ok(url.clone()),
            UpdateInfo::GitHubReleases {
                user,
                repo,
                tag,
                file_glob,
            } => github::resolve(github::API_BASE, user, repo, tag, file_glob, on_status),
            UpdateInfo::PlingV1 {
                product_id,
                file_glob,
            } => pling::resolve(pling::API_BASE, product_id, file_glob, on_status),
        }
    }
}

fn expect_parameter_count(tokens: &[&str], expected: usize) -> UpdateInfoResult<()> {
    if tokens.len() != expected {
        bail!(
            "update information of type {} has an invalid parameter count: expected {}, got {}",
            tokens[0],
            expected - 1,
            tokens.len() - 1,
        );
    }
    Ok(())
}
