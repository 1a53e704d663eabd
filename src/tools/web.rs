//! Web access tools: HTTP requests, page fetches and search.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{required_str, Tool};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; swe-agent/0.3)";
const MAX_PAGE_CHARS: usize = 20_000;

fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

/// Parse a tool-supplied URL, accepting only http and https.
fn parse_http_url(raw: &str) -> anyhow::Result<url::Url> {
    let url = url::Url::parse(raw.trim())
        .map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(anyhow::anyhow!("Unsupported URL scheme: {}", other)),
    }
}

/// Check an HTTP endpoint and report status and headers.
pub struct WebRequest;

#[async_trait]
impl Tool for WebRequest {
    fn name(&self) -> &str {
        "web_request"
    }

    fn description(&self) -> &str {
        "Send a GET or POST request to check a web endpoint. Returns status code, headers and content length, not the body."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "The URL to request"},
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST"],
                    "description": "HTTP method (default: GET)"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value, _workspace: &Path) -> anyhow::Result<String> {
        let url = parse_http_url(required_str(&args, "url")?)?;
        let method = args["method"].as_str().unwrap_or("GET").to_uppercase();
        let client = http_client(Duration::from_secs(10))?;

        let request = match method.as_str() {
            "GET" => client.get(url),
            "POST" => client.post(url),
            other => return Err(anyhow::anyhow!("Unsupported method: {}", other)),
        };
        let response = request.send().await?;

        let status = response.status();
        let final_url = response.url().to_string();
        let headers: serde_json::Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or_default().to_string()),
                )
            })
            .collect();
        let body = response.bytes().await?;

        let report = json!({
            "status_code": status.as_u16(),
            "success": status.as_u16() < 400,
            "url": final_url,
            "content_length": body.len(),
            "headers": headers,
        });
        Ok(serde_json::to_string_pretty(&report)?)
    }
}

/// Fetch content from a URL.
pub struct FetchUrl;

#[async_trait]
impl Tool for FetchUrl {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch the content of a URL. HTML pages are reduced to their text. Useful for reading documentation or APIs."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value, _workspace: &Path) -> anyhow::Result<String> {
        let url = parse_http_url(required_str(&args, "url")?)?;
        let response = http_client(Duration::from_secs(30))?.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(anyhow::anyhow!("HTTP error: {}", status));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_default();

        let body = response.text().await?;
        let result = if content_type.contains("text/html") {
            extract_text_from_html(&body)
        } else {
            body
        };

        if result.chars().count() > MAX_PAGE_CHARS {
            let head: String = result.chars().take(MAX_PAGE_CHARS).collect();
            Ok(format!(
                "{}... [content truncated, showing first {} chars]",
                head, MAX_PAGE_CHARS
            ))
        } else {
            Ok(result)
        }
    }
}

/// Search the web through DuckDuckGo's HTML endpoint.
pub struct WebSearch;

#[async_trait]
impl Tool for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for information. Returns result titles, snippets and URLs. Use for finding documentation or examples."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "num_results": {
                    "type": "integer",
                    "description": "Maximum number of results to return (default: 5)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, _workspace: &Path) -> anyhow::Result<String> {
        let query = required_str(&args, "query")?;
        let num_results = args["num_results"].as_u64().unwrap_or(5).max(1) as usize;

        let url = format!(
            "https://html.duckduckgo.com/html/?q={}",
            urlencoding::encode(query)
        );
        let html = http_client(Duration::from_secs(30))?
            .get(&url)
            .send()
            .await?
            .text()
            .await?;

        let results = extract_ddg_results(&html, num_results);
        if results.is_empty() {
            Ok(format!("No results found for: {}", query))
        } else {
            Ok(results.join("\n\n"))
        }
    }
}

/// Text between the first `>` after `marker` and the following `<`.
fn tag_text<'a>(chunk: &'a str, marker: &str) -> Option<&'a str> {
    chunk
        .split(marker)
        .nth(1)
        .and_then(|s| s.split('>').nth(1))
        .and_then(|s| s.split('<').next())
        .map(str::trim)
}

fn extract_ddg_results(html: &str, limit: usize) -> Vec<String> {
    html.split("class=\"result__body\"")
        .skip(1)
        .filter_map(|chunk| {
            let title = tag_text(chunk, "class=\"result__a\"").filter(|t| !t.is_empty())?;
            let snippet = tag_text(chunk, "class=\"result__snippet\"").unwrap_or("No snippet");
            let url = tag_text(chunk, "class=\"result__url\"").unwrap_or("");
            Some(format!(
                "**{}**\n{}\nURL: {}",
                html_decode(title),
                html_decode(snippet),
                url
            ))
        })
        .take(limit)
        .collect()
}

/// `&amp;` goes last so an escaped entity like `&amp;lt;` stays `&lt;`.
fn html_decode(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Drop a `<tag ...>...</tag>` block everywhere.
fn strip_block(mut text: String, open: &str, close: &str) -> String {
    while let Some(start) = text.find(open) {
        match text[start..].find(close) {
            Some(end) => text.replace_range(start..start + end + close.len(), ""),
            None => break,
        }
    }
    text
}

fn extract_text_from_html(html: &str) -> String {
    let text = strip_block(html.to_string(), "<script", "</script>");
    let text = strip_block(text, "<style", "</style>");

    let mut result = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(c),
            _ => {}
        }
    }

    html_decode(&result.split_whitespace().collect::<Vec<_>>().join(" "))
}
