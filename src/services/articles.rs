// src/services/articles.rs

//! HTTP article fetcher.
//!
//! Downloads a page and extracts title, byline and main text with CSS
//! selectors. The text is rendered as light Markdown (headings, paragraphs,
//! list items).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use scraper::{ElementRef, Html, Selector};

use super::{ArticleFetcher, FetchedArticle};
use crate::error::ProcessError;
use crate::utils::http::retry_after;

const TITLE_SELECTORS: [&str; 4] = [
    r#"meta[property="og:title"]"#,
    r#"meta[name="twitter:title"]"#,
    "title",
    "h1",
];

const AUTHOR_SELECTORS: [&str; 5] = [
    r#"meta[name="author"]"#,
    r#"meta[property="article:author"]"#,
    r#"meta[name="twitter:creator"]"#,
    r#"[rel="author"]"#,
    ".byline",
];

const PUBLISHED_SELECTORS: [&str; 3] = [
    r#"meta[property="article:published_time"]"#,
    r#"meta[name="date"]"#,
    "time[datetime]",
];

/// Containers tried in order; the first with any text wins.
const CONTENT_ROOTS: [&str; 4] = ["article", "main", r#"[role="main"]"#, "body"];
const BLOCKS: &str = "h1, h2, h3, h4, p, li, pre, blockquote";
const SKIP_ANCESTORS: [&str; 6] = ["nav", "aside", "footer", "header", "script", "style"];

/// Fetches articles over HTTP.
pub struct HttpArticleFetcher {
    client: Client,
    max_body_bytes: usize,
}

impl HttpArticleFetcher {
    pub fn new(client: Client, max_body_bytes: usize) -> Self {
        Self {
            client,
            max_body_bytes,
        }
    }

    async fn download(&self, url: &str) -> Result<(String, String), ProcessError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            return Err(ProcessError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            return Err(ProcessError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(len) = declared.filter(|len| *len > self.max_body_bytes) {
            return Err(ProcessError::TooLarge(len));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if !is_html(&content_type) {
            return Err(ProcessError::UnsupportedContent(content_type));
        }

        let final_url = response.url().to_string();
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() > self.max_body_bytes {
                return Err(ProcessError::TooLarge(body.len()));
            }
        }

        Ok((final_url, String::from_utf8_lossy(&body).into_owned()))
    }
}

#[async_trait]
impl ArticleFetcher for HttpArticleFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedArticle, ProcessError> {
        let (final_url, html) = self.download(url).await?;
        let mut article = extract(&html);
        article.final_url = final_url;
        if article.text.trim().is_empty() {
            return Err(ProcessError::Unparseable(format!("no readable text at {url}")));
        }
        Ok(article)
    }
}

fn is_html(content_type: &str) -> bool {
    content_type.contains("text/html") || content_type.contains("application/xhtml")
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

fn clean(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_value(element: ElementRef<'_>) -> String {
    let raw = if element.value().name() == "meta" {
        element.value().attr("content").unwrap_or("").to_string()
    } else if let Some(datetime) = element.value().attr("datetime") {
        datetime.to_string()
    } else {
        element.text().collect()
    };
    clean(&raw)
}

fn first_match(document: &Html, selectors: &[&str]) -> Option<String> {
    selectors
        .iter()
        .filter_map(|s| selector(s))
        .filter_map(|sel| document.select(&sel).next().map(element_value))
        .find(|value| value.chars().count() > 1)
}

fn in_boilerplate(element: ElementRef<'_>) -> bool {
    element.ancestors().any(|node| {
        node.value()
            .as_element()
            .is_some_and(|e| SKIP_ANCESTORS.contains(&e.name()))
    })
}

fn markdown_block(element: ElementRef<'_>) -> Option<String> {
    let text = clean(&element.text().collect::<String>());
    if text.is_empty() {
        return None;
    }
    let block = match element.value().name() {
        "h1" => format!("# {text}"),
        "h2" => format!("## {text}"),
        "h3" | "h4" => format!("### {text}"),
        "li" => format!("- {text}"),
        "blockquote" => format!("> {text}"),
        _ => text,
    };
    Some(block)
}

fn main_text(document: &Html) -> String {
    let Some(blocks) = selector(BLOCKS) else {
        return String::new();
    };
    for root in CONTENT_ROOTS.iter().filter_map(|s| selector(s)) {
        let Some(container) = document.select(&root).next() else {
            continue;
        };
        let parts: Vec<String> = container
            .select(&blocks)
            .filter(|e| !in_boilerplate(*e))
            .filter_map(markdown_block)
            .collect();
        if !parts.is_empty() {
            return parts.join("\n\n");
        }
    }
    String::new()
}

/// Extract article fields from an HTML document.
pub(crate) fn extract(html: &str) -> FetchedArticle {
    let document = Html::parse_document(html);

    let language = selector("html[lang]")
        .and_then(|sel| document.select(&sel).next())
        .and_then(|e| e.value().attr("lang"))
        .map(|lang| lang.trim().to_lowercase())
        .filter(|lang| !lang.is_empty());

    let published_at = first_match(&document, &PUBLISHED_SELECTORS)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|t| t.with_timezone(&Utc));

    let author = first_match(&document, &AUTHOR_SELECTORS).map(|a| {
        let a = a.strip_prefix("By ").or_else(|| a.strip_prefix("by ")).unwrap_or(&a);
        a.chars().take(100).collect()
    });

    FetchedArticle {
        final_url: String::new(),
        title: first_match(&document, &TITLE_SELECTORS),
        author,
        language,
        published_at,
        text: main_text(&document),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <title>Fallback title</title>
  <meta property="og:title" content="Context Protocols Explained">
  <meta name="author" content="By Jane Doe">
  <meta property="article:published_time" content="2026-10-18T12:00:00Z">
</head>
<body>
  <nav><ul><li>Home</li><li>About</li></ul></nav>
  <article>
    <h1>Context Protocols Explained</h1>
    <p>First paragraph   with   spacing.</p>
    <ul><li>Point one</li></ul>
    <footer><p>Copyright</p></footer>
  </article>
</body>
</html>"#;

    #[test]
    fn test_extract_metadata() {
        let article = extract(PAGE);
        assert_eq!(article.title.as_deref(), Some("Context Protocols Explained"));
        assert_eq!(article.author.as_deref(), Some("Jane Doe"));
        assert_eq!(article.language.as_deref(), Some("en"));
        assert!(article.published_at.is_some());
    }

    #[test]
    fn test_extract_main_text_skips_boilerplate() {
        let article = extract(PAGE);
        assert_eq!(
            article.text,
            "# Context Protocols Explained\n\nFirst paragraph with spacing.\n\n- Point one"
        );
    }

    #[test]
    fn test_extract_empty_page() {
        let article = extract("<html><body><script>x()</script></body></html>");
        assert!(article.text.is_empty());
        assert!(article.title.is_none());
    }

    #[test]
    fn test_is_html() {
        assert!(is_html("text/html; charset=utf-8"));
        assert!(is_html("application/xhtml+xml"));
        assert!(!is_html("application/pdf"));
    }
}
