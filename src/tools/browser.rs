//! Browser automation over the W3C WebDriver HTTP protocol.
//!
//! One session is shared by every web step of the process. It is created
//! lazily on first use against the configured WebDriver endpoint (for example
//! `chromedriver --port=9515`) and lives until [`BrowserSession::close`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::web::normalize_url;
use super::{opt_str_arg, str_arg, Arguments, Tool, ToolContext, ToolName, ToolOutput};

/// Key of an element reference in WebDriver responses.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// How an element is looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub using: &'static str,
    pub value: String,
}

impl Locator {
    fn css(value: impl Into<String>) -> Self {
        Self {
            using: "css selector",
            value: value.into(),
        }
    }

    fn attribute(name: &str, value: &str) -> Self {
        Self::css(format!(
            "[{}=\"{}\"]",
            name,
            value.replace('\\', "\\\\").replace('"', "\\\"")
        ))
    }
}

fn looks_like_xpath(selector: &str) -> bool {
    selector.starts_with('/') || selector.starts_with("(/") || selector.starts_with("./")
}

/// Lookup order for form fields: id, name, CSS, XPath.
pub fn field_locators(selector: &str) -> Vec<Locator> {
    if looks_like_xpath(selector) {
        return vec![Locator {
            using: "xpath",
            value: selector.to_string(),
        }];
    }
    vec![
        Locator::attribute("id", selector),
        Locator::attribute("name", selector),
        Locator::css(selector),
    ]
}

/// Lookup order for clicks: id, CSS, XPath, name, exact then partial link text.
pub fn click_locators(selector: &str) -> Vec<Locator> {
    if looks_like_xpath(selector) {
        return vec![Locator {
            using: "xpath",
            value: selector.to_string(),
        }];
    }
    vec![
        Locator::attribute("id", selector),
        Locator::css(selector),
        Locator::attribute("name", selector),
        Locator {
            using: "link text",
            value: selector.to_string(),
        },
        Locator {
            using: "partial link text",
            value: selector.to_string(),
        },
    ]
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Lazily created WebDriver session.
pub struct BrowserSession {
    webdriver_url: String,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
}

impl BrowserSession {
    pub fn new(webdriver_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            webdriver_url: webdriver_url.trim_end_matches('/').to_string(),
            http,
            session_id: Mutex::new(None),
        }
    }

    pub async fn is_open(&self) -> bool {
        self.session_id.lock().await.is_some()
    }

    /// Send one command and unwrap the `value` member of the reply.
    async fn command(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.webdriver_url, path);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("WebDriver at {} is not reachable: {}", self.webdriver_url, e))?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        if !status.is_success() {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| value.get("error").and_then(Value::as_str))
                .unwrap_or("unknown error");
            return Err(anyhow::anyhow!("WebDriver error ({}): {}", status, message));
        }
        Ok(value)
    }

    /// Existing session id, or a new session.
    async fn session(&self) -> anyhow::Result<String> {
        let mut guard = self.session_id.lock().await;
        if let Some(id) = guard.as_ref() {
            return Ok(id.clone());
        }

        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {"args": ["--start-maximized"]}
                }
            }
        });
        let value = self
            .command(reqwest::Method::POST, "/session", Some(capabilities))
            .await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("WebDriver returned no session id"))?
            .to_string();

        tracing::info!("Started browser session {}", id);
        *guard = Some(id.clone());
        Ok(id)
    }

    async fn session_command(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> anyhow::Result<Value> {
        let id = self.session().await?;
        self.command(method, &format!("/session/{}{}", id, path), body)
            .await
    }

    /// Load `url` and return the page title.
    pub async fn navigate(&self, url: &str) -> anyhow::Result<String> {
        self.session_command(reqwest::Method::POST, "/url", Some(json!({ "url": url })))
            .await?;
        let title = self
            .session_command(reqwest::Method::GET, "/title", None)
            .await?;
        Ok(value_text(&title))
    }

    pub async fn current_url(&self) -> anyhow::Result<String> {
        let url = self.session_command(reqwest::Method::GET, "/url", None).await?;
        Ok(value_text(&url))
    }

    async fn find(&self, locator: &Locator) -> Option<String> {
        let body = json!({"using": locator.using, "value": locator.value});
        let value = self
            .session_command(reqwest::Method::POST, "/element", Some(body))
            .await
            .ok()?;
        value.get(ELEMENT_KEY).and_then(Value::as_str).map(String::from)
    }

    /// First element found by any locator, in order.
    pub async fn find_first(&self, locators: &[Locator]) -> Option<String> {
        for locator in locators {
            if let Some(element) = self.find(locator).await {
                return Some(element);
            }
        }
        None
    }

    async fn element_command(
        &self,
        method: reqwest::Method,
        element: &str,
        path: &str,
        body: Option<Value>,
    ) -> anyhow::Result<Value> {
        self.session_command(method, &format!("/element/{}{}", element, path), body)
            .await
    }

    async fn element_text(&self, element: &str) -> anyhow::Result<String> {
        let text = self
            .element_command(reqwest::Method::GET, element, "/text", None)
            .await?;
        Ok(value_text(&text))
    }

    /// Texts of every element matching a CSS selector.
    pub async fn texts(&self, selector: &str) -> anyhow::Result<Vec<String>> {
        let found = self
            .session_command(
                reqwest::Method::POST,
                "/elements",
                Some(json!({"using": "css selector", "value": selector})),
            )
            .await?;

        let mut texts = Vec::new();
        for element in found.as_array().into_iter().flatten() {
            if let Some(id) = element.get(ELEMENT_KEY).and_then(Value::as_str) {
                texts.push(self.element_text(id).await?);
            }
        }
        Ok(texts)
    }

    pub async fn page_text(&self) -> anyhow::Result<String> {
        let body = self
            .find(&Locator {
                using: "tag name",
                value: "body".to_string(),
            })
            .await
            .ok_or_else(|| anyhow::anyhow!("Page has no body"))?;
        self.element_text(&body).await
    }

    pub async fn click(&self, element: &str) -> anyhow::Result<()> {
        self.element_command(reqwest::Method::POST, element, "/click", Some(json!({})))
            .await?;
        Ok(())
    }

    /// Set a field's value according to its kind: select, checkbox or text.
    pub async fn fill(&self, element: &str, value: &Value) -> anyhow::Result<()> {
        let tag = value_text(
            &self
                .element_command(reqwest::Method::GET, element, "/name", None)
                .await?,
        )
        .to_lowercase();

        if tag == "select" {
            let wanted = value_text(value);
            let options = self
                .element_command(
                    reqwest::Method::POST,
                    element,
                    "/elements",
                    Some(json!({"using": "tag name", "value": "option"})),
                )
                .await?;
            for option in options.as_array().into_iter().flatten() {
                let Some(id) = option.get(ELEMENT_KEY).and_then(Value::as_str) else {
                    continue;
                };
                let text = self.element_text(id).await?;
                let option_value = value_text(
                    &self
                        .element_command(reqwest::Method::GET, id, "/property/value", None)
                        .await?,
                );
                if text.trim() == wanted || option_value == wanted {
                    return self.click(id).await;
                }
            }
            return Err(anyhow::anyhow!("Option '{}' not found", wanted));
        }

        let input_type = value_text(
            &self
                .element_command(reqwest::Method::GET, element, "/attribute/type", None)
                .await?,
        )
        .to_lowercase();
        if input_type == "checkbox" || input_type == "radio" {
            let selected = self
                .element_command(reqwest::Method::GET, element, "/selected", None)
                .await?
                .as_bool()
                .unwrap_or(false);
            if selected != is_truthy(value) {
                self.click(element).await?;
            }
            return Ok(());
        }

        self.element_command(reqwest::Method::POST, element, "/clear", Some(json!({})))
            .await?;
        self.element_command(
            reqwest::Method::POST,
            element,
            "/value",
            Some(json!({"text": value_text(value)})),
        )
        .await?;
        Ok(())
    }

    /// End the session if one is open.
    pub async fn close(&self) {
        let id = self.session_id.lock().await.take();
        if let Some(id) = id {
            if let Err(e) = self
                .command(reqwest::Method::DELETE, &format!("/session/{}", id), None)
                .await
            {
                tracing::warn!("Failed to close browser session {}: {}", id, e);
            }
        }
    }
}

/// Fill form fields, optionally loading a page first.
pub struct WebFillForm;

#[async_trait]
impl Tool for WebFillForm {
    fn name(&self) -> ToolName {
        ToolName::WebFillForm
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let fields = args
            .get("fields")
            .and_then(Value::as_object)
            .ok_or_else(|| anyhow::anyhow!("Missing 'fields' argument"))?;
        if let Some(url) = opt_str_arg(args, "url") {
            ctx.browser.navigate(&normalize_url(url)?).await?;
        }

        let mut filled = Vec::new();
        let mut missing = Vec::new();
        for (selector, value) in fields {
            match ctx.browser.find_first(&field_locators(selector)).await {
                Some(element) => {
                    ctx.browser.fill(&element, value).await?;
                    filled.push(selector.clone());
                }
                None => missing.push(selector.clone()),
            }
        }

        if filled.is_empty() && !missing.is_empty() {
            return Err(anyhow::anyhow!("No form fields found: {}", missing.join(", ")));
        }
        let mut message = format!("Filled {} fields", filled.len());
        if !missing.is_empty() {
            message.push_str(&format!(" (not found: {})", missing.join(", ")));
        }
        Ok(ToolOutput::new(message).with_data(json!({"filled": filled, "missing": missing})))
    }
}

/// Click an element of the open page.
pub struct WebClick;

#[async_trait]
impl Tool for WebClick {
    fn name(&self) -> ToolName {
        ToolName::WebClick
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let selector = str_arg(args, "selector")?;
        if !ctx.browser.is_open().await {
            return Err(anyhow::anyhow!("No open browser; open a page with open_url first"));
        }
        let element = ctx
            .browser
            .find_first(&click_locators(selector))
            .await
            .ok_or_else(|| anyhow::anyhow!("Element not found: {}", selector))?;
        ctx.browser.click(&element).await?;
        Ok(ToolOutput::new(format!("Clicked {}", selector)))
    }
}
