//! Resolution through the GitHub releases API.

use reportify::{bail, ResultExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::{pattern, StatusCallback, UpdateInfoResult};

pub(crate) const API_BASE: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    assets: Vec<Asset>,
    #[serde(default)]
    prerelease: bool,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

/// Resolve the release matching `tag` and pick the best asset.
pub(crate) fn resolve(
    api_base: &str,
    user: &str,
    repo: &str,
    tag: &str,
    file_glob: &str,
    on_status: StatusCallback,
) -> UpdateInfoResult<String> {
    let release = fetch_release(api_base, user, repo, tag, on_status)?;
    if release.assets.is_empty() {
        bail!(
            "no artifacts found in the release data; please contact the author of \
             the AppImage and tell them the files are missing on the releases page"
        );
    }
    // The update information pattern matches the end of the file name.
    let pattern = format!("*{file_glob}");
    let mut matching = Vec::new();
    for asset in release.assets {
        if pattern::matches(&pattern, &asset.name)? {
            matching.push(asset.browser_download_url);
        }
    }
    if matching.is_empty() {
        bail!(
            "none of the artifacts matched the pattern {file_glob:?}; the pattern is \
             most likely out of date, please contact the author of the AppImage and \
             ask them to revise the update information"
        );
    }
    // Descending sort puts the latest release first as long as the
    // vendor's naming scheme sorts lexicographically.
    matching.sort_unstable_by(|a, b| b.cmp(a));
    let best = matching.swap_remove(0);
    on_status(format!("Found matching release artifact: {best}"));
    Ok(best)
}

fn fetch_release(
    api_base: &str,
    user: &str,
    repo: &str,
    tag: &str,
    on_status: StatusCallback,
) -> UpdateInfoResult<Release> {
    match tag {
        "latest" => {
            on_status("Fetching latest release information from GitHub API".to_owned());
            get_json(&format!("{api_base}/repos/{user}/{repo}/releases/latest"))
        }
        "latest-pre" | "latest-all" => {
            on_status(format!(
                "Fetching release list from GitHub API for pseudo-tag \"{tag}\""
            ));
            let releases: Vec<Release> =
                get_json(&format!("{api_base}/repos/{user}/{repo}/releases"))?;
            let Some(release) = releases
                .into_iter()
                .find(|release| tag == "latest-all" || release.prerelease)
            else {
                bail!("no release matching pseudo-tag \"{tag}\" found");
            };
            Ok(release)
        }
        _ => {
            on_status(format!(
                "Fetching release information for tag \"{tag}\" from GitHub API"
            ));
            get_json(&format!("{api_base}/repos/{user}/{repo}/releases/tags/{tag}"))
        }
    }
}

fn get_json<T: DeserializeOwned>(url: &str) -> UpdateInfoResult<T> {
    debug!(url = %url, "requesting release data");
    let mut response = appup_http::agent()
        .get(url)
        .call()
        .whatever_with(|error| format!("GitHub API request failed: {error}"))?;
    let body = response
        .body_mut()
        .read_to_string()
        .whatever("unable to read GitHub API response")?;
    serde_json::from_str(&body).whatever("failed to parse GitHub API response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testserver::serve;

    fn release_json(assets: &[(&str, &str)], prerelease: bool) -> String {
        let assets = assets
            .iter()
            .map(|(name, url)| {
                format!(r#"{{"name": "{name}", "browser_download_url": "{url}"}}"#)
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(r#"{{"prerelease": {prerelease}, "assets": [{assets}]}}"#)
    }

    #[test]
    fn test_latest_release_picks_greatest_match() {
        let body = release_json(
            &[
                (
                    "App-1.0-x86_64.AppImage.zsync",
                    "https://dl/App-1.0-x86_64.AppImage.zsync",
                ),
                (
                    "App-1.1-x86_64.AppImage.zsync",
                    "https://dl/App-1.1-x86_64.AppImage.zsync",
                ),
                ("App-1.1-x86_64.AppImage", "https://dl/App-1.1-x86_64.AppImage"),
            ],
            false,
        );
        let base = serve(
            vec![("/repos/me/app/releases/latest".to_owned(), body)],
            1,
        );
        let mut messages = Vec::new();
        let url = resolve(
            &base,
            "me",
            "app",
            "latest",
            "App-*-x86_64.AppImage.zsync",
            &mut |message| messages.push(message),
        )
        .unwrap();
        assert_eq!(url, "https://dl/App-1.1-x86_64.AppImage.zsync");
        assert!(messages
            .iter()
            .any(|message| message.contains("latest release information")));
        assert!(messages
            .iter()
            .any(|message| message.contains("App-1.1-x86_64.AppImage.zsync")));
    }

    #[test]
    fn test_explicit_tag_uses_the_tag_endpoint() {
        let body = release_json(&[("App-2.0.AppImage.zsync", "https://dl/App-2.0.zsync")], false);
        let base = serve(
            vec![("/repos/me/app/releases/tags/v2.0".to_owned(), body)],
            1,
        );
        let mut sink = |_: String| {};
        let url = resolve(&base, "me", "app", "v2.0", "*.zsync", &mut sink).unwrap();
        assert_eq!(url, "https://dl/App-2.0.zsync");
    }

    #[test]
    fn test_latest_pre_takes_the_first_prerelease() {
        let stable = release_json(&[("App-2.0.AppImage.zsync", "https://dl/2.0.zsync")], false);
        let pre = release_json(&[("App-2.1rc1.AppImage.zsync", "https://dl/2.1rc1.zsync")], true);
        let body = format!("[{stable}, {pre}]");
        let base = serve(vec![("/repos/me/app/releases".to_owned(), body)], 1);
        let mut sink = |_: String| {};
        let url = resolve(&base, "me", "app", "latest-pre", "*.zsync", &mut sink).unwrap();
        assert_eq!(url, "https://dl/2.1rc1.zsync");
    }

    #[test]
    fn test_latest_all_takes_the_first_release() {
        let stable = release_json(&[("App-2.0.AppImage.zsync", "https://dl/2.0.zsync")], false);
        let pre = release_json(&[("App-2.1rc1.AppImage.zsync", "https://dl/2.1rc1.zsync")], true);
        let body = format!("[{stable}, {pre}]");
        let base = serve(vec![("/repos/me/app/releases".to_owned(), body)], 1);
        let mut sink = |_: String| {};
        let url = resolve(&base, "me", "app", "latest-all", "*.zsync", &mut sink).unwrap();
        assert_eq!(url, "https://dl/2.0.zsync");
    }

    #[test]
    fn test_release_without_assets_is_an_error() {
        let base = serve(
            vec![(
                "/repos/me/app/releases/latest".to_owned(),
                r#"{"prerelease": false, "assets": []}"#.to_owned(),
            )],
            1,
        );
        let mut sink = |_: String| {};
        let error = resolve(&base, "me", "app", "latest", "*.zsync", &mut sink).unwrap_err();
        assert!(format!("{error:?}").contains("no artifacts"));
    }

    #[test]
    fn test_no_matching_asset_is_an_error() {
        let body = release_json(&[("Other-1.0.tar.gz", "https://dl/other.tar.gz")], false);
        let base = serve(
            vec![("/repos/me/app/releases/latest".to_owned(), body)],
            1,
        );
        let mut sink = |_: String| {};
        let error = resolve(
            &base,
            "me",
            "app",
            "latest",
            "App-*-x86_64.AppImage",
            &mut sink,
        )
        .unwrap_err();
        assert!(format!("{error:?}").contains("none of the artifacts matched"));
    }

    #[test]
    fn test_http_error_carries_the_status_code() {
        let base = serve(Vec::new(), 1);
        let mut sink = |_: String| {};
        let error = resolve(&base, "me", "app", "latest", "*.zsync", &mut sink).unwrap_err();
        assert!(format!("{error:?}").contains("404"));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let base = serve(
            vec![(
                "/repos/me/app/releases/latest".to_owned(),
                "not json".to_owned(),
            )],
            1,
        );
        let mut sink = |_: String| {};
        let error = resolve(&base, "me", "app", "latest", "*.zsync", &mut sink).unwrap_err();
        assert!(format!("{error:?}").contains("parse"));
    }
}
