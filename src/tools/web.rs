//! Web access tools: open pages and scrape their text.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::terminal::run_helper;
use super::{opt_str_arg, str_arg, Arguments, Tool, ToolContext, ToolName, ToolOutput};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; Atlas/2.1)";
const MAX_PAGE_TEXT: usize = 3000;

/// Add `https://` when the address has no scheme.
pub(crate) fn normalize_url(raw: &str) -> anyhow::Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow::anyhow!("Missing 'url' argument"));
    }
    let candidate = if raw.contains("://") || raw.starts_with("file:") || raw.starts_with("about:") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };
    let parsed = url::Url::parse(&candidate)
        .map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", raw, e))?;
    Ok(parsed.to_string())
}

/// Open in the platform's default browser.
async fn open_in_system_browser(url: &str) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(15);
    if cfg!(target_os = "windows") {
        run_helper("cmd", &["/C", "start", "", url], timeout).await?;
    } else if cfg!(target_os = "macos") {
        run_helper("open", &[url], timeout).await?;
    } else {
        run_helper("xdg-open", &[url], timeout).await?;
    }
    Ok(())
}

/// Open a page in the automated browser, or the system browser without one.
pub struct OpenUrl;

#[async_trait]
impl Tool for OpenUrl {
    fn name(&self) -> ToolName {
        ToolName::OpenUrl
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let url = normalize_url(str_arg(args, "url")?)?;

        match ctx.browser.navigate(&url).await {
            Ok(title) => Ok(ToolOutput::new(format!("Opened {} ({})", url, title))
                .with_data(json!({"url": url, "title": title}))),
            Err(e) => {
                tracing::info!("Browser automation unavailable ({}), using system browser", e);
                open_in_system_browser(&url).await?;
                Ok(ToolOutput::new(format!("Opened {} in the system browser", url))
                    .with_data(json!({"url": url})))
            }
        }
    }
}

/// Page text, or the texts of elements matching a selector.
pub struct WebScrape;

#[async_trait]
impl Tool for WebScrape {
    fn name(&self) -> ToolName {
        ToolName::WebScrape
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let selector = opt_str_arg(args, "selector");

        let (source, texts, page_text) = match opt_str_arg(args, "url") {
            Some(raw) => {
                let url = normalize_url(raw)?;
                let html = fetch_html(&url).await?;
                let texts = selector.map(|s| select_texts(&html, s));
                (url, texts, extract_text_from_html(&html))
            }
            None => {
                if !ctx.browser.is_open().await {
                    return Err(anyhow::anyhow!("No URL and no open browser"));
                }
                let texts = match selector {
                    Some(s) => Some(ctx.browser.texts(s).await?),
                    None => None,
                };
                (ctx.browser.current_url().await?, texts, ctx.browser.page_text().await?)
            }
        };

        match texts {
            Some(texts) => Ok(ToolOutput::new(format!(
                "Found {} elements matching '{}' on {}",
                texts.len(),
                selector.unwrap_or_default(),
                source
            ))
            .with_data(json!(texts))),
            None => {
                let text: String = page_text.chars().take(MAX_PAGE_TEXT).collect();
                Ok(ToolOutput::new(format!(
                    "Scraped {} characters from {}",
                    text.chars().count(),
                    source
                ))
                .with_data(Value::String(text)))
            }
        }
    }
}

async fn fetch_html(url: &str) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()?;

    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow::anyhow!("HTTP error: {}", status));
    }
    Ok(response.text().await?)
}

/// Basic HTML entity decoding.
fn html_decode(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Drop the element and everything inside it, for each `<tag ...>...</tag>`.
fn strip_element(html: &str, tag: &str) -> String {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut text = html.to_string();
    while let Some(start) = text.to_ascii_lowercase().find(&open) {
        match text[start..].to_ascii_lowercase().find(&close) {
            Some(end) => text.replace_range(start..start + end + close.len(), ""),
            None => break,
        }
    }
    text
}

/// Readable text of an HTML document.
fn extract_text_from_html(html: &str) -> String {
    let text = strip_element(&strip_element(html, "script"), "style");

    let mut result = String::new();
    let mut in_tag = false;
    for c in text.chars() {
        if c == '<' {
            in_tag = true;
        } else if c == '>' {
            in_tag = false;
            result.push(' ');
        } else if !in_tag {
            result.push(c);
        }
    }

    let result = result.split_whitespace().collect::<Vec<_>>().join(" ");
    html_decode(&result)
}

/// One compound selector: `tag`, `#id`, `.class`, `[attr=value]` and combinations.
#[derive(Debug, Default, PartialEq)]
struct SimpleSelector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

impl SimpleSelector {
    /// Only the last compound of a descendant selector is matched.
    fn parse(selector: &str) -> Option<Self> {
        let last = selector.split(|c: char| c.is_whitespace() || c == '>').filter(|s| !s.is_empty()).last()?;
        let re = Regex::new(r#"^([a-zA-Z][\w-]*|\*)?((?:#[\w-]+|\.[\w-]+|\[[\w-]+(?:=["']?[^\]"']*["']?)?\])*)$"#).ok()?;
        let caps = re.captures(last)?;

        let mut parsed = SimpleSelector {
            tag: caps.get(1).map(|m| m.as_str().to_lowercase()).filter(|t| t != "*"),
            ..Default::default()
        };
        let part = Regex::new(r#"#([\w-]+)|\.([\w-]+)|\[([\w-]+)(?:=["']?([^\]"']*)["']?)?\]"#).ok()?;
        for p in part.captures_iter(caps.get(2).map_or("", |m| m.as_str())) {
            if let Some(id) = p.get(1) {
                parsed.id = Some(id.as_str().to_string());
            } else if let Some(class) = p.get(2) {
                parsed.classes.push(class.as_str().to_string());
            } else if let Some(name) = p.get(3) {
                parsed
                    .attrs
                    .push((name.as_str().to_lowercase(), p.get(4).map(|v| v.as_str().to_string())));
            }
        }
        Some(parsed)
    }

    fn matches(&self, tag: &str, attributes: &str) -> bool {
        if self.tag.as_deref().map_or(false, |t| t != tag) {
            return false;
        }
        let value_of = |name: &str| -> Option<String> {
            let re = Regex::new(&format!(r#"(?i)(?:^|\s){}\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#, regex::escape(name))).ok()?;
            let c = re.captures(attributes)?;
            c.get(1).or_else(|| c.get(2)).or_else(|| c.get(3)).map(|m| html_decode(m.as_str()))
        };
        let has_attr = |name: &str| -> bool {
            Regex::new(&format!(r"(?i)(?:^|\s){}(?:\s*=|\s|$)", regex::escape(name)))
                .map(|re| re.is_match(attributes))
                .unwrap_or(false)
        };

        if let Some(id) = &self.id {
            if value_of("id").as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let classes = value_of("class").unwrap_or_default();
            let present: Vec<&str> = classes.split_whitespace().collect();
            if !self.classes.iter().all(|c| present.contains(&c.as_str())) {
                return false;
            }
        }
        self.attrs.iter().all(|(name, expected)| match expected {
            Some(v) => value_of(name).as_deref() == Some(v.as_str()),
            None => has_attr(name),
        })
    }
}

/// Texts of the elements in `html` matching a simple CSS selector.
fn select_texts(html: &str, selector: &str) -> Vec<String> {
    let Some(selector) = SimpleSelector::parse(selector) else {
        return Vec::new();
    };
    let Ok(start_tag) = Regex::new(r"<([a-zA-Z][\w-]*)([^>]*)>") else {
        return Vec::new();
    };

    let mut texts = Vec::new();
    for cap in start_tag.captures_iter(html) {
        let tag = cap[1].to_lowercase();
        if !selector.matches(&tag, &cap[2]) {
            continue;
        }
        let Some(whole) = cap.get(0) else { continue };
        let body = &html[whole.end()..];
        let inner = match closing_offset(body, &tag) {
            Some(end) => &body[..end],
            None => "",
        };
        let text = extract_text_from_html(inner);
        if !text.is_empty() {
            texts.push(text);
        }
    }
    texts
}

/// Offset of the `</tag>` that closes an element whose body starts at `body`.
fn closing_offset(body: &str, tag: &str) -> Option<usize> {
    let re = Regex::new(&format!(r"(?i)<(/?){}\b[^>]*>", regex::escape(tag))).ok()?;
    let mut depth = 1usize;
    for m in re.captures_iter(body) {
        let whole = m.get(0)?;
        if &m[1] == "/" {
            depth -= 1;
            if depth == 0 {
                return Some(whole.start());
            }
        } else if !whole.as_str().ends_with("/>") {
            depth += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{args, context};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const PAGE: &str = r#"<html><head><style>p{}</style><script>var x = "<b>";</script></head>
<body><h1 id="top">Prices &amp; offers</h1>
<div class="item sale"><span>Tea</span> 4 <div>nested</div></div>
<div class="item">Coffee 6</div>
<a href="/x" data-kind="main">Link</a></body></html>"#;

    async fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("example.com").unwrap(), "https://example.com/");
        assert_eq!(normalize_url("http://a.org/x").unwrap(), "http://a.org/x");
        assert!(normalize_url("  ").is_err());
    }

    #[test]
    fn test_extract_text_skips_scripts() {
        let text = extract_text_from_html(PAGE);
        assert!(text.starts_with("Prices & offers Tea 4 nested"));
        assert!(!text.contains("var x"));
    }

    #[test]
    fn test_select_texts() {
        assert_eq!(select_texts(PAGE, "div.item"), vec!["Tea 4 nested", "Coffee 6"]);
        assert_eq!(select_texts(PAGE, ".sale"), vec!["Tea 4 nested"]);
        assert_eq!(select_texts(PAGE, "#top"), vec!["Prices & offers"]);
        assert_eq!(select_texts(PAGE, "body a[data-kind=main]"), vec!["Link"]);
        assert!(select_texts(PAGE, "table").is_empty());
    }

    #[tokio::test]
    async fn test_scrape_fetched_page() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path());

        let url = serve_once(PAGE).await;
        let out = WebScrape
            .execute(&args(json!({"url": url, "selector": ".item"})), &ctx)
            .await
            .unwrap();
        assert_eq!(out.data, json!(["Tea 4 nested", "Coffee 6"]));

        let url = serve_once(PAGE).await;
        let out = WebScrape.execute(&args(json!({"url": url})), &ctx).await.unwrap();
        assert!(out.data.as_str().unwrap().contains("Coffee 6"));
    }

    #[tokio::test]
    async fn test_scrape_without_page_fails() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path());
        let err = WebScrape.execute(&args(json!({})), &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "No URL and no open browser");
    }
}
