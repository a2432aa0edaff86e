use std::collections::{BTreeMap, HashSet};
use url::Url;
use xxhash_rust::xxh64::xxh64;

// * Tracking parameters stripped during normalization
// ! Add new tracking params here as they are discovered.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "gclid",
    "fbclid",
    "ref",
    "yclid",
    "_ga",
];

// * Normalizes a URL to a unique, deterministic representation.
// * Used to fingerprint candidates so the same image is only queued once per run.
// *
// * Logic:
// * 1. Join href with base_url.
// * 2. Strip Fragment (#).
// * 3. Lowercase Hostname.
// * 4. Remove Tracking Parameters (utm_*, gclid, etc.).
// * 5. Sort Query Parameters alphabetically.
pub fn normalize_url(href: &str, base_url: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    let mut url = base.join(href).ok()?;

    url.set_fragment(None);

    if let Some(host) = url.host_str() {
        let lower_host = host.to_lowercase();
        if url.set_host(Some(&lower_host)).is_err() {
            return None;
        }
    }

    // * BTreeMap keeps keys sorted
    let drop_params: HashSet<&str> = TRACKING_PARAMS.iter().copied().collect();
    let mut clean_pairs = BTreeMap::new();
    for (k, v) in url.query_pairs() {
        if !drop_params.contains(k.to_lowercase().as_str()) {
            clean_pairs.insert(k.into_owned(), v.into_owned());
        }
    }

    if clean_pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url.query_pairs_mut();
        serializer.clear();
        for (k, v) in clean_pairs {
            serializer.append_pair(&k, &v);
        }
    }

    Some(url.to_string())
}

// * Normalizes an absolute URL on its own
pub fn normalize_absolute(url: &str) -> Option<String> {
    normalize_url(url, url)
}

// * xxh64 of the normalized URL, or of the raw string when it does not parse
pub fn url_fingerprint(url: &str) -> u64 {
    match normalize_absolute(url) {
        Some(normalized) => xxh64(normalized.as_bytes(), 0),
        None => xxh64(url.trim().as_bytes(), 0),
    }
}

// * Domain key used for per-site limits and the circuit breaker: lowercase host[:port]
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    match parsed.port() {
        Some(port) => Some(format!("{}:{}", host, port)),
        None => Some(host),
    }
}

// * scheme://host[:port]/ used as the default Referer
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    match parsed.origin() {
        url::Origin::Tuple(..) => Some(format!("{}/", parsed.origin().ascii_serialization())),
        url::Origin::Opaque(_) => None,
    }
}

// * Lowercase file extension of the URL path, without the dot
pub fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?.to_string();
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_lowercase())
}

// * True when any path token matches a keyword (split on '/', '_', '-', '.')
pub fn path_has_keyword(url: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return false;
    }
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_lowercase(),
        Err(_) => url.to_lowercase(),
    };
    path.split(|c: char| matches!(c, '/' | '_' | '-' | '.'))
        .filter(|token| !token.is_empty())
        .any(|token| keywords.iter().any(|k| k.eq_ignore_ascii_case(token)))
}
