use snapcrawler::engine::normalization::{domain_of, normalize_url, url_fingerprint};

// * Test Suite for URL Normalization

#[test]
fn test_basic_normalization() {
    let base = "https://example.com";
    let href = "page";
    assert_eq!(normalize_url(href, base).unwrap(), "https://example.com/page");
}

#[test]
fn test_strip_fragment() {
    let base = "https://example.com";
    let href = "page#section1";
    assert_eq!(normalize_url(href, base).unwrap(), "https://example.com/page");
}

#[test]
fn test_lowercase_host() {
    let base = "https://EXAMPLE.com";
    let href = "/page";
    assert_eq!(normalize_url(href, base).unwrap(), "https://example.com/page");
}

#[test]
fn test_tracking_param_removal() {
    let base = "https://example.com";
    // * Complex URL with mixed tracking and real params
    let href = "/product?id=123&utm_source=google&ref=landing&gclid=xyz&sort=asc";
    
    let normalized = normalize_url(href, base).unwrap();
    // * Expect: id=123 and sort=asc ONLY.
    assert!(normalized.contains("id=123"));
    assert!(normalized.contains("sort=asc"));
    assert!(!normalized.contains("utm_source"));
    assert!(!normalized.contains("gclid"));
}

#[test]
fn test_query_sorting() {
    let base = "https://example.com";
    // * Input order: b, a, c
    let href = "/search?b=2&a=1&c=3";
    
    let normalized = normalize_url(href, base).unwrap();
    // * Expect sorted order: a=1&b=2&c=3
    assert_eq!(normalized, "https://example.com/search?a=1&b=2&c=3");
}

#[test]
fn test_invalid_base() {
    let base = "not_a_url";
    let href = "page";
    assert_eq!(normalize_url(href, base), None);
}

#[test]
fn test_relative_image_src() {
    let base = "https://Gallery.example.com/albums/2024/index.html";
    let href = "../../images/cat.jpg?utm_medium=social";
    assert_eq!(
        normalize_url(href, base).unwrap(),
        "https://gallery.example.com/images/cat.jpg"
    );
}

#[test]
fn test_fingerprint_matches_normalized_forms() {
    assert_eq!(
        url_fingerprint("https://CDN.example.com/a.jpg#zoom"),
        url_fingerprint("https://cdn.example.com/a.jpg")
    );
    assert_eq!(domain_of("https://CDN.example.com/a.jpg").as_deref(), Some("cdn.example.com"));
}
