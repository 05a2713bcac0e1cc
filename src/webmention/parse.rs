//! HTML inspection for webmentions
//!
//! Link extraction, `<title>`, and the subset of microformats2 needed to
//! describe a mention: h-entry `url`, `name`, `content` and `author`.

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::urls::same_url;

/// Longest stored mention content, in characters.
pub const MAX_CONTENT_CHARS: usize = 500;
/// Longest stored mention title, in characters.
pub const MAX_TITLE_CHARS: usize = 60;

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

/// All absolute http(s) links in `html`; relative ones resolve against
/// `base`.
pub fn extract_links(html: &str, base: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    extract_links_from(&document, base)
}

fn extract_links_from(document: &Html, base: &str) -> Vec<String> {
    let base = Url::parse(base).ok();
    let Some(anchors) = selector("a[href], area[href]") else {
        return Vec::new();
    };

    let mut links: Vec<String> = Vec::new();
    for element in document.select(&anchors) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let resolved = match &base {
            Some(base) => base.join(href.trim()),
            None => Url::parse(href.trim()),
        };
        let Ok(mut resolved) = resolved else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        resolved.set_fragment(None);
        let link = resolved.to_string();
        if !links.contains(&link) {
            links.push(link);
        }
    }
    links
}

/// Text of the document `<title>`.
pub fn html_title(html: &str) -> Option<String> {
    title_of(&Html::parse_document(html))
}

fn title_of(document: &Html) -> Option<String> {
    let title = selector("title")?;
    document
        .select(&title)
        .next()
        .map(|t| collapse_whitespace(&t.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

/// Properties of one h-entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HEntry {
    pub urls: Vec<String>,
    pub name: Option<String>,
    /// Text of `e-content`, whitespace collapsed
    pub content: Option<String>,
    pub author: Option<String>,
}

/// Everything verification needs from a source document
#[derive(Debug, Clone, Default)]
pub struct SourceDocument {
    pub links: Vec<String>,
    pub title: Option<String>,
    pub entries: Vec<HEntry>,
}

impl SourceDocument {
    pub fn parse(html: &str, source_url: &str) -> Self {
        let document = Html::parse_document(html);
        Self {
            links: extract_links_from(&document, source_url),
            title: title_of(&document),
            entries: h_entries(&document, source_url),
        }
    }

    /// Whether any link points at `target` (percent-decoded,
    /// case-insensitive).
    pub fn links_to(&self, target: &str) -> bool {
        self.links.iter().any(|link| same_url(link, target))
    }

    /// The h-entry describing `source`: the one whose `url` matches it,
    /// else the first one without any `url`.
    pub fn entry_for(&self, source: &str) -> Option<&HEntry> {
        self.entries
            .iter()
            .find(|entry| entry.urls.iter().any(|u| same_url(u, source)))
            .or_else(|| self.entries.iter().find(|entry| entry.urls.is_empty()))
    }
}

fn h_entries(document: &Html, base: &str) -> Vec<HEntry> {
    let base = Url::parse(base).ok();
    let Some(entries) = selector(".h-entry") else {
        return Vec::new();
    };

    document
        .select(&entries)
        .map(|element| {
            let mut entry = HEntry::default();
            collect_properties(element, base.as_ref(), &mut entry);
            entry
        })
        .collect()
}

fn is_root_class(class: &str) -> bool {
    class
        .strip_prefix("h-")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_lowercase() || c == '-'))
}

/// Walk the children of an h-* root, stopping at nested roots.
fn collect_properties(element: ElementRef<'_>, base: Option<&Url>, entry: &mut HEntry) {
    for child in element.children().filter_map(ElementRef::wrap) {
        let classes: Vec<&str> = child.value().classes().collect();
        let nested_root = classes.iter().any(|c| is_root_class(c));

        if classes.contains(&"p-author") && entry.author.is_none() {
            entry.author = author_name(child).filter(|a| !a.is_empty());
        }
        if nested_root {
            continue;
        }

        if classes.contains(&"u-url") {
            if let Some(url) = url_value(child, base) {
                entry.urls.push(url);
            }
        }
        if classes.contains(&"p-name") && entry.name.is_none() {
            entry.name = Some(text_value(child)).filter(|n| !n.is_empty());
        }
        if classes.contains(&"e-content") && entry.content.is_none() {
            entry.content = Some(text_value(child)).filter(|c| !c.is_empty());
        }

        collect_properties(child, base, entry);
    }
}

fn author_name(author: ElementRef<'_>) -> Option<String> {
    let is_card = author.value().classes().any(|c| c == "h-card");
    if is_card {
        if let Some(name) = selector(".p-name").and_then(|s| author.select(&s).next()) {
            return Some(text_value(name));
        }
    }
    Some(text_value(author))
}

fn url_value(element: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
    let value = element.value();
    let raw = match value.name() {
        "a" | "area" | "link" => value.attr("href"),
        "img" | "audio" | "video" | "source" => value.attr("src"),
        _ => None,
    }
    .map(str::to_string)
    .unwrap_or_else(|| text_value(element));

    if raw.is_empty() {
        return None;
    }
    match base {
        Some(base) => base.join(&raw).ok().map(|u| u.to_string()),
        None => Some(raw),
    }
}

fn text_value(element: ElementRef<'_>) -> String {
    if element.value().name() == "img" {
        return element.value().attr("alt").unwrap_or_default().trim().to_string();
    }
    collapse_whitespace(&element.text().collect::<String>())
}

/// Collapse runs of whitespace to one space and trim.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `text` to at most `max` characters, ending in `…` when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"<!DOCTYPE html>
<html><head><title>  A   reply </title></head>
<body>
  <article class="h-entry">
    <a class="u-url" href="/post">permalink</a>
    <h1 class="p-name">Hi</h1>
    <div class="p-author h-card"><a class="u-url" href="https://src/">home</a><span class="p-name">Ann</span></div>
    <div class="e-content"><p>hello
       world</p></div>
    <a href="https://self/p">x</a>
    <a href="mailto:me@src">mail</a>
  </article>
</body></html>"#;

    #[test]
    fn links_are_absolute_and_deduplicated() {
        let links = extract_links(
            r##"<a href="/a">1</a><a href="/a#frag">2</a><a href="https://x/b">3</a><a href="ftp://x/c">4</a>"##,
            "https://src/post",
        );
        assert_eq!(links, vec!["https://src/a".to_string(), "https://x/b".to_string()]);
    }

    #[test]
    fn source_document_reads_h_entry() {
        let doc = SourceDocument::parse(SOURCE, "https://src/post");

        assert!(doc.links_to("https://self/p"));
        assert!(!doc.links_to("https://self/q"));
        assert_eq!(doc.title.as_deref(), Some("A reply"));

        let entry = doc.entry_for("https://src/post").unwrap();
        assert_eq!(entry.urls, vec!["https://src/post".to_string()]);
        assert_eq!(entry.name.as_deref(), Some("Hi"));
        assert_eq!(entry.content.as_deref(), Some("hello world"));
        assert_eq!(entry.author.as_deref(), Some("Ann"));
    }

    #[test]
    fn entry_without_url_is_used_as_fallback() {
        let doc = SourceDocument::parse(
            r#"<div class="h-entry"><a class="u-url" href="https://elsewhere/">x</a></div>
               <div class="h-entry"><span class="p-name">Fallback</span></div>"#,
            "https://src/post",
        );
        assert_eq!(
            doc.entry_for("https://src/post").unwrap().name.as_deref(),
            Some("Fallback")
        );
    }

    #[test]
    fn percent_encoded_links_match() {
        let doc = SourceDocument::parse(
            r#"<a href="https://self/caf%C3%A9">x</a>"#,
            "https://src/post",
        );
        assert!(doc.links_to("https://self/café"));
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("short", 60), "short");

        let long = "é".repeat(700);
        let truncated = truncate_chars(&long, MAX_CONTENT_CHARS);
        assert_eq!(truncated.chars().count(), MAX_CONTENT_CHARS);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn nested_roots_do_not_leak_properties() {
        let doc = SourceDocument::parse(
            r#"<article class="h-entry">
                 <a class="u-url" href="/post">permalink</a>
                 <div class="e-content">Quoting
                   <blockquote class="h-cite">
                     <span class="p-name">Quoted title</span>
                     <a class="u-url" href="https://other/q">q</a>
                   </blockquote>
                 </div>
               </article>"#,
            "https://src/post",
        );

        let entry = doc.entry_for("https://src/post").unwrap();
        assert_eq!(entry.name, None);
        assert_eq!(entry.urls, vec!["https://src/post".to_string()]);
        assert!(entry.content.as_deref().unwrap().contains("Quoted title"));
    }

    #[test]
    fn title_is_truncated_to_sixty_characters() {
        let title = truncate_chars(&"t".repeat(100), MAX_TITLE_CHARS);
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
        assert_eq!(title, format!("{}…", "t".repeat(59)));
    }
}
