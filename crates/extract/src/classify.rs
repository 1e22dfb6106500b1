use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};

use crawlsite_core::PageType;

/// Output of the content classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedPage {
    pub title: Option<String>,
    pub word_count: usize,
    pub has_header: bool,
    pub has_footer: bool,
    pub has_navigation: bool,
    pub page_type: PageType,
    pub structure_digest: String,
}

static HEADER_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("header, [role=banner]").unwrap());
static FOOTER_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("footer, [role=contentinfo]").unwrap());
static NAV_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("nav, [role=navigation]").unwrap());
static TITLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static SCRIPT_STYLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("script, style").unwrap());
static COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

/// Classifies a fetched body into a `ClassifiedPage`. Needs the fetch
/// status, not just body text, because `error`/`redirect` page types are
/// determined by status code.
pub fn classify(html: &str, fetch_status: u16) -> ClassifiedPage {
    let document = Html::parse_document(html);

    let title = document
        .select(&TITLE_SEL)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let has_header = document.select(&HEADER_SEL).next().is_some();
    let has_footer = document.select(&FOOTER_SEL).next().is_some();
    let has_navigation = document.select(&NAV_SEL).next().is_some();

    let word_count = count_words(&document);
    let structure_digest = digest_structure(&document);

    let page_type = classify_page_type(
        fetch_status,
        word_count,
        has_header,
        has_footer,
        has_navigation,
    );

    ClassifiedPage {
        title,
        word_count,
        has_header,
        has_footer,
        has_navigation,
        page_type,
        structure_digest,
    }
}

fn classify_page_type(
    fetch_status: u16,
    word_count: usize,
    has_header: bool,
    has_footer: bool,
    has_navigation: bool,
) -> PageType {
    if (400..600).contains(&fetch_status) {
        return PageType::Error;
    }
    if (300..400).contains(&fetch_status) && word_count == 0 {
        return PageType::Redirect;
    }
    if word_count < 50 && (has_header || has_footer || has_navigation) {
        return PageType::Blank;
    }
    PageType::Content
}

/// Tokenizes body text after stripping `<script>`, `<style>`, and HTML
/// comments.
fn count_words(document: &Html) -> usize {
    let html_sans_comments = COMMENT_RE.replace_all(&document.html(), "");
    let stripped = Html::parse_document(&html_sans_comments);

    let script_style: std::collections::HashSet<_> = stripped
        .select(&SCRIPT_STYLE_SEL)
        .flat_map(|el| el.descendants().map(|n| n.id()))
        .collect();

    let mut text = String::new();
    if let Some(body) = Selector::parse("body")
        .ok()
        .and_then(|sel| stripped.select(&sel).next())
    {
        for node in body.descendants() {
            if script_style.contains(&node.id()) {
                continue;
            }
            if let Some(t) = node.value().as_text() {
                text.push_str(t);
                text.push(' ');
            }
        }
    }

    text.split_whitespace().count()
}

/// SHA-256 of the tag-skeleton string built by walking the parse tree in
/// document order with text stripped.
fn digest_structure(document: &Html) -> String {
    let mut skeleton = String::new();
    walk_tags(document.root_element(), &mut skeleton);

    let mut hasher = Sha256::new();
    hasher.update(skeleton.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn walk_tags(el: ElementRef, out: &mut String) {
    out.push('<');
    out.push_str(el.value().name());
    out.push('>');
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            walk_tags(child_el, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_wins_regardless_of_body() {
        let page = classify("<html><body><header></header><p>hello world</p></body></html>", 404);
        assert_eq!(page.page_type, PageType::Error);
    }

    #[test]
    fn redirect_with_empty_body() {
        let page = classify("", 302);
        assert_eq!(page.page_type, PageType::Redirect);
    }

    #[test]
    fn blank_when_short_and_structural() {
        let html = "<html><body><header>Site</header><footer>(c)</footer></body></html>";
        let page = classify(html, 200);
        assert_eq!(page.page_type, PageType::Blank);
        assert!(page.has_header);
        assert!(page.has_footer);
    }

    #[test]
    fn content_when_no_chrome_and_short() {
        let page = classify("<html><body><p>hi</p></body></html>", 200);
        assert_eq!(page.page_type, PageType::Content);
    }

    #[test]
    fn word_count_ignores_script_and_style() {
        let html = r#"<html><body>
            <script>var reallyLongJunkTokenThatShouldNotCount = 1;</script>
            <style>.a { color: red; }</style>
            <p>four real words here</p>
        </body></html>"#;
        let page = classify(html, 200);
        assert_eq!(page.word_count, 4);
    }

    #[test]
    fn aria_role_counts_as_structural_chrome() {
        let html = r#"<html><body><div role="navigation">menu</div></body></html>"#;
        let page = classify(html, 200);
        assert!(page.has_navigation);
    }

    #[test]
    fn structure_digest_stable_across_equivalent_text() {
        let a = classify("<html><body><p>hello</p></body></html>", 200);
        let b = classify("<html><body><p>goodbye</p></body></html>", 200);
        assert_eq!(a.structure_digest, b.structure_digest);
    }

    #[test]
    fn structure_digest_differs_on_different_tags() {
        let a = classify("<html><body><p>hello</p></body></html>", 200);
        let b = classify("<html><body><span>hello</span></body></html>", 200);
        assert_ne!(a.structure_digest, b.structure_digest);
    }

    #[test]
    fn title_trimmed_and_absent_if_missing() {
        let page = classify("<html><head><title>  My Page  </title></head><body></body></html>", 200);
        assert_eq!(page.title.as_deref(), Some("My Page"));
        let none_page = classify("<html><body></body></html>", 200);
        assert_eq!(none_page.title, None);
    }
}
