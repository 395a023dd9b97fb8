//! Resolution through the Pling OCS API.

use regex::Regex;
use reportify::{bail, ResultExt};
use tracing::debug;

use crate::{pattern, StatusCallback, UpdateInfoResult};

pub(crate) const API_BASE: &str = "https://api.pling.com";

/// Resolve the product's best matching download.
///
/// The OCS content endpoint lists downloads as
/// `<downloadlinkN>URL</downloadlinkN>` entries. Pling generates a
/// zsync control file for every uploaded file, so the control file URL
/// is the download URL with a literal `.zsync` suffix.
pub(crate) fn resolve(
    api_base: &str,
    product_id: &str,
    file_glob: &str,
    on_status: StatusCallback,
) -> UpdateInfoResult<String> {
    on_status(format!(
        "Fetching information for product {product_id} from the Pling API"
    ));
    let body = get_text(&format!("{api_base}/ocs/v1/content/data/{product_id}"))?;
    let link = Regex::new(r"<downloadlink\d+>(.*?)</downloadlink\d+>")
        .whatever("invalid download link pattern")?;
    let mut best: Option<(String, String)> = None;
    for capture in link.captures_iter(&body) {
        let url = &capture[1];
        let name = match url.rfind('/') {
            Some(index) => &url[index + 1..],
            None => url,
        };
        if !pattern::matches(file_glob, name)? {
            continue;
        }
        // Keep only the lexicographically greatest file name.
        if best
            .as_ref()
            .map_or(true, |(best_name, _)| name > best_name.as_str())
        {
            best = Some((name.to_owned(), url.to_owned()));
        }
    }
    let Some((name, url)) = best else {
        bail!("no download matching {file_glob:?} found for product {product_id}");
    };
    on_status(format!("Found matching download: {name}"));
    Ok(format!("{url}.zsync"))
}

fn get_text(url: &str) -> UpdateInfoResult<String> {
    debug!(url = %url, "requesting product data");
    let mut response = appup_http::agent()
        .get(url)
        .call()
        .whatever_with(|error| format!("Pling API request failed: {error}"))?;
    response
        .body_mut()
        .read_to_string()
        .whatever("unable to read Pling API response")
}
