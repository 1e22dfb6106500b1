use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crawlsite_core::{LinkToggles, LinkType};

/// One discovered hyperlink, canonicalized and typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLink {
    pub url: String,
    pub link_type: LinkType,
}

/// Conservative URL-shaped match inside inline `<script>` text — matches
/// only bare absolute http(s) URLs, never attempts to parse JS.
static INLINE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>\\]+"#).unwrap());

/// Walks the document for hyperlinks and canonicalizes each into an
/// absolute URL plus `LinkType`. Returns links in document order,
/// deduplicated by canonicalized URL (first occurrence keeps its
/// link_type) — running `extract` again on the deduplicated output is a
/// fixpoint because `canonicalize_url` is idempotent.
pub fn extract(html: &str, base_url: &Url, toggles: LinkToggles) -> Vec<ExtractedLink> {
    let document = Html::parse_document(html);
    let seed_host = base_url.host_str().unwrap_or("").to_lowercase();

    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<ExtractedLink> = Vec::new();

    // `same_origin_allowed` gates whether a same-origin link of this
    // category survives; external links are gated by `toggles.external`
    // alone, regardless of which tag/category produced them.
    let mut push = |raw: &str, same_origin_allowed: bool, type_for_same_origin: LinkType| {
        let Some(resolved) = resolve(base_url, raw) else {
            return;
        };
        let canonical = canonicalize_url(&resolved);
        let host = resolved.host_str().unwrap_or("").to_lowercase();
        let is_external = !seed_host.is_empty() && host != seed_host;

        let link_type = if is_external {
            if !toggles.external {
                return;
            }
            LinkType::External
        } else {
            if !same_origin_allowed {
                return;
            }
            type_for_same_origin
        };

        if seen.insert(canonical.clone()) {
            out.push(ExtractedLink {
                url: canonical,
                link_type,
            });
        }
    };

    if toggles.static_anchor || toggles.external {
        for sel_str in ["a[href]", "link[href]", "area[href]"] {
            if let Ok(sel) = Selector::parse(sel_str) {
                for el in document.select(&sel) {
                    if let Some(href) = el.value().attr("href") {
                        push(href, toggles.static_anchor, LinkType::StaticHtml);
                    }
                }
            }
        }
    }

    if toggles.dynamic || toggles.external {
        if let Ok(sel) = Selector::parse("[onclick], [data-url], [data-href]") {
            for el in document.select(&sel) {
                for attr in ["onclick", "data-url", "data-href"] {
                    if let Some(val) = el.value().attr(attr) {
                        for candidate in extract_url_like_substrings(val) {
                            push(&candidate, toggles.dynamic, LinkType::DynamicJs);
                        }
                    }
                }
            }
        }
        if let Ok(sel) = Selector::parse("script:not([src])") {
            for el in document.select(&sel) {
                let text = el.text().collect::<String>();
                for m in INLINE_URL_RE.find_iter(&text) {
                    push(m.as_str(), toggles.dynamic, LinkType::DynamicJs);
                }
            }
        }
    }

    if toggles.resource || toggles.external {
        for (sel_str, attr) in [
            ("img[src]", "src"),
            ("script[src]", "src"),
            ("link[rel=stylesheet][href]", "href"),
            ("source[src]", "src"),
        ] {
            if let Ok(sel) = Selector::parse(sel_str) {
                for el in document.select(&sel) {
                    if let Some(val) = el.value().attr(attr) {
                        push(val, toggles.resource, LinkType::Resource);
                    }
                }
            }
        }
    }

    out
}

fn resolve(base: &Url, href: &str) -> Option<Url> {
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }
    base.join(href).ok()
}

fn extract_url_like_substrings(text: &str) -> Vec<String> {
    INLINE_URL_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Canonicalize: scheme + host lowercased; default ports stripped;
/// fragments removed; path normalized; query preserved byte-for-byte.
pub fn canonicalize_url(url: &Url) -> String {
    let mut u = url.clone();
    let _ = u.set_scheme(&u.scheme().to_lowercase());
    if let Some(host) = u.host_str() {
        let lower = host.to_lowercase();
        let _ = u.set_host(Some(&lower));
    }
    u.set_fragment(None);

    let default_port = match u.scheme() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    if u.port() == default_port {
        let _ = u.set_port(None);
    }

    let path = u.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        u.set_path(&path[..path.len() - 1]);
    }

    u.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toggles_all() -> LinkToggles {
        LinkToggles {
            static_anchor: true,
            dynamic: true,
            resource: true,
            external: true,
        }
    }

    #[test]
    fn extracts_static_anchors_same_origin() {
        let base = Url::parse("http://a.example/").unwrap();
        let html = r#"<a href="/x">x</a><a href="/y">y</a>"#;
        let links = extract(html, &base, LinkToggles::default());
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.link_type == LinkType::StaticHtml));
    }

    #[test]
    fn dedups_by_canonical_url() {
        let base = Url::parse("http://a.example/").unwrap();
        let html = r#"<a href="/x">one</a><a href="/x/">two</a><a href="/x#frag">three</a>"#;
        let links = extract(html, &base, LinkToggles::default());
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn external_links_need_toggle() {
        let base = Url::parse("http://a.example/").unwrap();
        let html = r#"<a href="http://other.example/">ext</a>"#;
        let without = extract(html, &base, LinkToggles::default());
        assert!(without.is_empty());
        let with = extract(html, &base, toggles_all());
        assert_eq!(with.len(), 1);
        assert_eq!(with[0].link_type, LinkType::External);
    }

    #[test]
    fn same_origin_links_still_need_their_own_toggle_when_external_is_on() {
        let base = Url::parse("http://a.example/").unwrap();
        let html = r#"<a href="/same-origin">same</a>"#;
        let toggles = LinkToggles {
            static_anchor: false,
            dynamic: false,
            resource: false,
            external: true,
        };
        let links = extract(html, &base, toggles);
        assert!(links.is_empty());
    }

    #[test]
    fn canonicalize_strips_default_port_and_fragment() {
        let u = Url::parse("HTTP://Example.com:80/a/b/#frag").unwrap();
        assert_eq!(canonicalize_url(&u), "http://example.com/a/b");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let u = Url::parse("http://Example.com:80/a/b/?q=1#frag").unwrap();
        let once = canonicalize_url(&u);
        let reparsed = Url::parse(&once).unwrap();
        let twice = canonicalize_url(&reparsed);
        assert_eq!(once, twice);
    }

    #[test]
    fn malformed_hrefs_are_dropped_silently() {
        let base = Url::parse("http://a.example/").unwrap();
        let html = r#"<a href="javascript:void(0)">no</a><a href="mailto:x@y.com">no</a>"#;
        let links = extract(html, &base, LinkToggles::default());
        assert!(links.is_empty());
    }
}
