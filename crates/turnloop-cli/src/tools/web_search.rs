//! Web search tool using DuckDuckGo

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use turnloop_core::{ParameterProperty, ParameterSchema, Tool, ToolContext};

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 25;

/// Shared HTTP client for connection pooling
static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (compatible; turnloop)")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

/// Tool for searching the web
pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web using DuckDuckGo. Returns search results with titles, URLs, and snippets."
    }

    fn parameters_schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .with_required("query", ParameterProperty::string("The search query"))
            .with_property(
                "limit",
                ParameterProperty::integer("Maximum number of results (default: 10)")
                    .with_default(Value::Number(DEFAULT_LIMIT.into())),
            )
    }

    #[instrument(skip(self, args, _ctx), fields(query = tracing::field::Empty))]
    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<Value> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| anyhow!("Missing required parameter: query"))?;

        let preview: String = query.chars().take(50).collect();
        tracing::Span::current().record("query", preview.as_str());

        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| (v as usize).clamp(1, MAX_LIMIT))
            .unwrap_or(DEFAULT_LIMIT);

        let search_url = format!("{}?q={}", SEARCH_ENDPOINT, urlencoding::encode(query));
        debug!(limit, "Sending search request to DuckDuckGo");

        let response = shared_client()
            .get(&search_url)
            .send()
            .await
            .context("Search request failed")?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Search returned error status");
            bail!("Search failed with status: {}", response.status());
        }

        let html = response.text().await.context("Failed to read search response")?;
        let results = parse_duckduckgo_results(&html, limit)?;

        Ok(json!({
            "query": query,
            "results": results,
        }))
    }
}

#[derive(Debug, PartialEq, Serialize)]
struct SearchResult {
    title: String,
    url: String,
    snippet: String,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Invalid selector {}: {:?}", css, e))
}

fn parse_duckduckgo_results(html: &str, limit: usize) -> Result<Vec<SearchResult>> {
    let document = Html::parse_document(html);
    let result_selector = selector(".result")?;
    let title_selector = selector(".result__a")?;
    let snippet_selector = selector(".result__snippet")?;

    let mut results = Vec::new();
    for result_el in document.select(&result_selector) {
        if results.len() >= limit {
            break;
        }

        let title_el = result_el.select(&title_selector).next();
        let title = title_el
            .map(|el| el.text().collect::<Vec<_>>().join(" "))
            .unwrap_or_default()
            .trim()
            .to_string();
        let url = title_el
            .and_then(|el| el.value().attr("href"))
            .map(unwrap_redirect)
            .unwrap_or_default();
        let snippet = result_el
            .select(&snippet_selector)
            .next()
            .map(|el| el.text().collect::<Vec<_>>().join(" "))
            .unwrap_or_default()
            .trim()
            .to_string();

        if !title.is_empty() && !url.is_empty() {
            results.push(SearchResult { title, url, snippet });
        }
    }

    Ok(results)
}

/// DuckDuckGo wraps result links as `/l/?uddg=<encoded target>&...`
fn unwrap_redirect(href: &str) -> String {
    href.split("uddg=")
        .nth(1)
        .map(|rest| rest.split('&').next().unwrap_or(rest))
        .and_then(|encoded| urlencoding::decode(encoded).ok())
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|| href.to_string())
}
