//! Regex scraping of the panel's HTML pages.

use std::sync::OnceLock;

use regex::Regex;

/// Lazily compiled pattern. A compile failure is cached and reported on
/// every use instead of panicking.
pub(crate) type CachedRegex = OnceLock<Result<Regex, regex::Error>>;

pub(crate) fn cached_regex(
    cell: &'static CachedRegex,
    pattern: &str,
) -> Result<&'static Regex, regex::Error> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(Clone::clone)
}

static DIV_TAG: CachedRegex = OnceLock::new();
static SERVER_BODY_CLASS: CachedRegex = OnceLock::new();
static DATA_ID: CachedRegex = OnceLock::new();

/// Server ids listed on the `/servers/` page, in page order.
///
/// Each server card is a `<div class="server-body" data-id="...">`; the
/// attribute order inside the tag does not matter.
pub fn server_ids(page: &str) -> Result<Vec<String>, regex::Error> {
    let div_tag = cached_regex(&DIV_TAG, r"(?i)<div\b[^>]*>")?;
    let server_body = cached_regex(&SERVER_BODY_CLASS, r#"\bclass\s*=\s*["']server-body["']"#)?;
    let data_id = cached_regex(&DATA_ID, r#"\bdata-id\s*=\s*["']([^"']*)["']"#)?;

    let mut ids = Vec::new();
    for tag in div_tag.find_iter(page).map(|found| found.as_str()) {
        if !server_body.is_match(tag) {
            continue;
        }
        let Some(id) = data_id.captures(tag).map(|captures| captures[1].trim().to_string()) else {
            continue;
        };
        if !id.is_empty() && !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}
