//! Page discovery: scrape the viewer page for page-image paths.
//!
//! The viewer embeds one script statement per page:
//!
//! ```text
//! pages.push("/a/b/c/d/e/f/0001.png?time=1700000000&amp;key=9f2c");
//! ```
//!
//! Script text is split on whitespace and every token is matched against
//! the whole statement pattern. Tokens that do not match exactly are
//! skipped; nothing is extracted from a partial match. Document order is
//! page order.
//!
//! The same module reads the book id out of a viewer URL and the
//! descriptive fields out of the catalogue page.

use crate::collab::PageSource;
use crate::config::PipelineConfig;
use crate::error::Book2PdfError;
use crate::model::{BookInfo, PageRef};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::Arc;
use tracing::{debug, info, warn};

static STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^pages\.push\("(/\w+){7}\.png\?time=\d+&amp;key=\w+"\);$"#).unwrap()
});

static PAGE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(/\w+){7}\.png\?time=\d+&amp;key=\w+").unwrap());

static SCRIPT: Lazy<Selector> = Lazy::new(|| Selector::parse("script").unwrap());

// ── Pure parsing ─────────────────────────────────────────────────────────

/// The page path pushed by one script statement, or `None` when the
/// statement is not exactly a page push.
pub fn parse_page_path(statement: &str) -> Option<&str> {
    if !STATEMENT.is_match(statement) {
        return None;
    }
    PAGE_PATH.find(statement).map(|m| m.as_str())
}

/// Every page path pushed by the scripts of `html`, in document order.
pub fn extract_page_paths(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut paths = Vec::new();
    for script in document.select(&SCRIPT) {
        let text: String = script.text().collect();
        paths.extend(
            text.split_whitespace()
                .filter_map(parse_page_path)
                .map(str::to_string),
        );
    }
    paths
}

/// Absolute URL of a page path: host prefixed, HTML entity decoded.
pub fn page_url(viewer_base_url: &str, path: &str) -> String {
    format!("{}{}", viewer_base_url, path.replace("&amp;", "&"))
}

/// First non-blank value of `param` in `viewer_url`'s query.
pub fn book_id_from_viewer_url(viewer_url: &str, param: &str) -> Result<String, Book2PdfError> {
    let url = url::Url::parse(viewer_url.trim()).map_err(|_| Book2PdfError::MalformedUrl {
        url: viewer_url.to_string(),
    })?;
    url.query_pairs()
        .filter(|(k, _)| k == param)
        .map(|(_, v)| v.trim().to_string())
        .find(|v| !v.is_empty())
        .ok_or_else(|| Book2PdfError::MissingQueryParam {
            url: viewer_url.to_string(),
            param: param.to_string(),
        })
}

/// Title, author and cover image of a catalogue page. Blank or absent
/// fields are `None`.
pub fn parse_book_info(html: &str, viewer_base_url: &str) -> BookInfo {
    let document = Html::parse_document(html);
    let text_of = |css: &str| -> Option<String> {
        let selector = Selector::parse(css).ok()?;
        let el = document.select(&selector).next()?;
        let text = el.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        (!text.is_empty()).then_some(text)
    };

    let image_url = Selector::parse(".viewing-pic img[src]")
        .ok()
        .and_then(|sel| {
            document
                .select(&sel)
                .next()
                .and_then(|el| el.value().attr("src"))
                .map(str::trim)
                .filter(|src| !src.is_empty())
                .map(|src| {
                    if src.starts_with("http://") || src.starts_with("https://") {
                        src.to_string()
                    } else {
                        format!("{viewer_base_url}{src}")
                    }
                })
        });

    BookInfo {
        title: text_of(".arrival-title"),
        author: text_of(".arrival-info-author"),
        image_url,
    }
}

// ── Fetching extractor ───────────────────────────────────────────────────

/// Fetches viewer and catalogue pages through a [`PageSource`].
pub struct PageUrlExtractor {
    config: PipelineConfig,
    source: Arc<dyn PageSource>,
}

impl PageUrlExtractor {
    pub fn new(config: PipelineConfig, source: Arc<dyn PageSource>) -> Self {
        Self { config, source }
    }

    /// Ordered page references of the viewer page. Empty when the page
    /// has no page pushes; only fetch failures are errors.
    pub async fn discover(&self, viewer_url: &str) -> Result<Vec<PageRef>, Book2PdfError> {
        let html = self
            .source
            .fetch_text(viewer_url, self.config.fetch_timeout())
            .await?;
        let pages: Vec<PageRef> = extract_page_paths(&html)
            .iter()
            .enumerate()
            .map(|(i, path)| PageRef::new(i, page_url(&self.config.viewer_base_url, path)))
            .collect();

        if pages.is_empty() {
            info!(url = viewer_url, "No page URLs found on viewer page");
        } else {
            debug!(url = viewer_url, pages = pages.len(), "Discovered page URLs");
        }
        Ok(pages)
    }

    /// Descriptive fields of `book_id`. A failed fetch is logged and
    /// yields empty fields.
    pub async fn book_info(&self, book_id: &str) -> BookInfo {
        let url = self.config.catalogue_url(book_id);
        match self.source.fetch_text(&url, self.config.fetch_timeout()).await {
            Ok(html) => parse_book_info(&html, &self.config.viewer_base_url),
            Err(e) => {
                warn!(book_id, error = %e, "Catalogue page unavailable; storing book without details");
                BookInfo::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::memory::StaticPageSource;

    const PUSH: &str = r#"pages.push("/a/b/c/d/e/f/g.png?time=123&amp;key=xyz");"#;

    #[test]
    fn exact_statement_yields_path() {
        assert_eq!(
            parse_page_path(PUSH),
            Some("/a/b/c/d/e/f/g.png?time=123&amp;key=xyz")
        );
    }

    #[test]
    fn other_statements_yield_nothing() {
        assert_eq!(parse_page_path("foo();"), None);
        // Six segments.
        assert_eq!(
            parse_page_path(r#"pages.push("/b/c/d/e/f/g.png?time=123&amp;key=xyz");"#),
            None
        );
        // Unescaped ampersand.
        assert_eq!(
            parse_page_path(r#"pages.push("/a/b/c/d/e/f/g.png?time=123&key=xyz");"#),
            None
        );
        // Trailing garbage.
        assert_eq!(parse_page_path(&format!("{PUSH}x")), None);
    }

    #[test]
    fn statement_is_case_insensitive() {
        let upper = r#"PAGES.PUSH("/a/b/c/d/e/f/g.PNG?TIME=1&amp;KEY=k");"#;
        assert!(parse_page_path(upper).is_some());
    }

    #[test]
    fn paths_come_out_in_document_order() {
        let html = r#"<html><head>
            <script>var pages = [];
              pages.push("/s/b/1/2/3/4/0001.png?time=1&amp;key=a");
              pages.push("/s/b/1/2/3/4/0002.png?time=1&amp;key=b"); render(pages);
            </script>
            <script src="/app.js"></script>
            <script>pages.push("/s/b/1/2/3/4/0003.png?time=1&amp;key=c");</script>
            </head><body>pages.push("/s/b/1/2/3/4/9999.png?time=1&amp;key=z");</body></html>"#;
        let paths = extract_page_paths(html);
        assert_eq!(paths.len(), 3);
        assert!(paths[0].contains("0001"));
        assert!(paths[2].contains("0003"));
    }

    #[test]
    fn page_url_decodes_entity() {
        assert_eq!(
            page_url("https://kazneb.kz", "/a/b/c/d/e/f/g.png?time=1&amp;key=k"),
            "https://kazneb.kz/a/b/c/d/e/f/g.png?time=1&key=k"
        );
    }

    #[test]
    fn book_id_from_query() {
        let id = book_id_from_viewer_url(
            "https://kazneb.kz/bookView/view?brId=1557136&simple=true",
            "brId",
        )
        .unwrap();
        assert_eq!(id, "1557136");
    }

    #[test]
    fn book_id_errors_are_client_errors() {
        let missing = book_id_from_viewer_url("https://kazneb.kz/view?brId=", "brId").unwrap_err();
        assert!(matches!(missing, Book2PdfError::MissingQueryParam { .. }));
        assert_eq!(missing.status(), 400);

        let malformed = book_id_from_viewer_url("not a url", "brId").unwrap_err();
        assert!(matches!(malformed, Book2PdfError::MalformedUrl { .. }));
    }

    #[test]
    fn book_info_from_catalogue() {
        let html = r#"<div class="arrival-title"> Абай жолы </div>
            <div class="arrival-info-author">Мұхтар   Әуезов</div>
            <div class="viewing-pic"><img src="/covers/1.jpg"></div>"#;
        let info = parse_book_info(html, "https://kazneb.kz");
        assert_eq!(info.title.as_deref(), Some("Абай жолы"));
        assert_eq!(info.author.as_deref(), Some("Мұхтар Әуезов"));
        assert_eq!(info.image_url.as_deref(), Some("https://kazneb.kz/covers/1.jpg"));
    }

    #[test]
    fn book_info_blank_fields_are_none() {
        let info = parse_book_info(r#"<div class="arrival-title">  </div>"#, "https://h");
        assert_eq!(info, BookInfo::default());
    }

    #[tokio::test]
    async fn discover_builds_page_refs() {
        let source = Arc::new(StaticPageSource::new());
        let viewer = "https://kazneb.kz/view?brId=5";
        source
            .insert(
                viewer,
                format!(
                    "<script>{} {}</script>",
                    r#"pages.push("/a/b/c/d/e/f/p1.png?time=1&amp;key=a");"#,
                    r#"pages.push("/a/b/c/d/e/f/p2.png?time=1&amp;key=b");"#
                ),
            )
            .await;
        let extractor = PageUrlExtractor::new(PipelineConfig::default(), source);
        let pages = extractor.discover(viewer).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].sequence_index, 1);
        assert_eq!(pages[1].filename, "p2.png");
        assert_eq!(
            pages[0].source_url,
            "https://kazneb.kz/a/b/c/d/e/f/p1.png?time=1&key=a"
        );
    }

    #[tokio::test]
    async fn discover_without_pushes_is_empty() {
        let source = Arc::new(StaticPageSource::new());
        source.insert("https://h/v?brId=1", "<p>nothing</p>").await;
        let extractor = PageUrlExtractor::new(PipelineConfig::default(), source);
        assert!(extractor.discover("https://h/v?brId=1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn discover_surfaces_fetch_errors() {
        let extractor =
            PageUrlExtractor::new(PipelineConfig::default(), Arc::new(StaticPageSource::new()));
        let err = extractor.discover("https://h/v?brId=1").await.unwrap_err();
        assert!(matches!(err, Book2PdfError::FetchFailed { .. }));
    }

    #[tokio::test]
    async fn missing_catalogue_gives_empty_info() {
        let extractor =
            PageUrlExtractor::new(PipelineConfig::default(), Arc::new(StaticPageSource::new()));
        assert_eq!(extractor.book_info("1").await, BookInfo::default());
    }
}
