//! Server-side tool recognition and the chained web-search provider used to
//! satisfy Anthropic's `web_search` tool without forwarding it upstream.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct FilteredTools {
    pub regular_tools: Vec<ToolSpec>,
    pub server_tools: Vec<ToolSpec>,
    pub has_web_search: bool,
}

fn is_web_search_tool(tool: &ToolSpec) -> bool {
    tool.kind.to_lowercase().starts_with("web_search")
        || matches!(tool.name.to_lowercase().as_str(), "websearch" | "web_search")
}

/// Split `tools` into ones forwarded to the backend and server-side tools
/// the proxy executes itself.
pub fn filter_server_side_tools(tools: Vec<ToolSpec>) -> FilteredTools {
    let mut regular_tools = Vec::new();
    let mut server_tools = Vec::new();
    let mut has_web_search = false;

    for tool in tools {
        if is_web_search_tool(&tool) {
            has_web_search = true;
            server_tools.push(tool);
        } else {
            regular_tools.push(tool);
        }
    }

    FilteredTools { regular_tools, server_tools, has_web_search }
}

static TIME_SENSITIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(latest|recent news|current events|this week|today|breaking news)\b").unwrap());
static SEARCH_VERB_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bsearch\s+(?:the\s+web|online|for\s+\w+\s+(?:in|for)\s+\w+)\b").unwrap());
static SEARCH_X_IN_Y_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bsearch\s+\S+\s+(?:in|for)\s+\S+").unwrap());

/// Plain "search" alone is ambiguous with file search and must not fire;
/// time-sensitive cues or an explicit multi-word search verb do.
pub fn detect_search_intent(message: &str) -> bool {
    TIME_SENSITIVE_RE.is_match(message)
        || SEARCH_VERB_RE.is_match(message)
        || SEARCH_X_IN_Y_RE.is_match(message)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("all search providers exhausted")]
    AllProvidersFailed,
}

#[derive(Debug, Deserialize)]
struct SearxngResponse {
    results: Vec<SearxngResult>,
}

#[derive(Debug, Deserialize)]
struct SearxngResult {
    url: String,
    title: String,
    content: Option<String>,
}

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESULTS: usize = 10;

/// Chain: local meta-search instance, then public meta-search, then a paid
/// API if configured. Each provider gets a 5s timeout; connection refused,
/// non-200, or JSON parse failure falls through to the next provider.
pub async fn execute_search(
    client: &reqwest::Client,
    query: &str,
    config: &SearchConfig,
) -> Result<Vec<SearchResult>, SearchError> {
    let searxng_url =
        config.searxng_url.clone().or_else(|| std::env::var("SEARXNG_URL").ok());

    if let Some(base_url) = searxng_url
        && let Some(results) = try_searxng(client, &base_url, query).await
    {
        return Ok(results);
    }

    if config.public_fallback_enabled
        && let Some(results) = try_public_fallback(client, query).await
    {
        return Ok(results);
    }

    if let Some(api_key) = &config.api_key
        && let Some(results) = try_paid_api(client, query, api_key).await
    {
        return Ok(results);
    }

    Err(SearchError::AllProvidersFailed)
}

async fn try_searxng(client: &reqwest::Client, base_url: &str, query: &str) -> Option<Vec<SearchResult>> {
    let url = format!(
        "{}/search?q={}&format=json&categories=general",
        base_url.trim_end_matches('/'),
        urlencoding::encode(query)
    );
    let response = tokio::time::timeout(PROVIDER_TIMEOUT, client.get(&url).send()).await.ok()?.ok()?;
    if !response.status().is_success() {
        return None;
    }
    let parsed: SearxngResponse = response.json().await.ok()?;
    Some(
        parsed
            .results
            .into_iter()
            .take(MAX_RESULTS)
            .map(|r| SearchResult { url: r.url, title: r.title, snippet: r.content })
            .collect(),
    )
}

async fn try_public_fallback(client: &reqwest::Client, query: &str) -> Option<Vec<SearchResult>> {
    let url = format!("https://html.duckduckgo.com/html/?q={}", urlencoding::encode(query));
    let response = tokio::time::timeout(PROVIDER_TIMEOUT, client.get(&url).send()).await.ok()?.ok()?;
    if !response.status().is_success() {
        return None;
    }
    // Best-effort HTML scrape of result anchors; malformed pages yield an
    // empty (not erroring) result set so the caller still gets a response.
    let body = response.text().await.ok()?;
    Some(parse_duckduckgo_html(&body))
}

static DDG_RESULT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<a[^>]+class="result__a"[^>]+href="([^"]+)"[^>]*>(.*?)</a>"#).unwrap()
});

fn parse_duckduckgo_html(body: &str) -> Vec<SearchResult> {
    DDG_RESULT_RE
        .captures_iter(body)
        .take(MAX_RESULTS)
        .map(|cap| {
            let title = strip_tags(&cap[2]);
            SearchResult { url: cap[1].to_string(), title, snippet: None }
        })
        .collect()
}

fn strip_tags(html: &str) -> String {
    static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
    TAG_RE.replace_all(html, "").trim().to_string()
}

async fn try_paid_api(client: &reqwest::Client, query: &str, api_key: &str) -> Option<Vec<SearchResult>> {
    let url = format!("https://api.bing.microsoft.com/v7.0/search?q={}", urlencoding::encode(query));
    let response = tokio::time::timeout(
        PROVIDER_TIMEOUT,
        client.get(&url).header("Ocp-Apim-Subscription-Key", api_key).send(),
    )
    .await
    .ok()?
    .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let value: serde_json::Value = response.json().await.ok()?;
    let pages = value.get("webPages")?.get("value")?.as_array()?;
    Some(
        pages
            .iter()
            .take(MAX_RESULTS)
            .filter_map(|p| {
                Some(SearchResult {
                    url: p.get("url")?.as_str()?.to_string(),
                    title: p.get("name")?.as_str()?.to_string(),
                    snippet: p.get("snippet").and_then(|s| s.as_str()).map(|s| s.to_string()),
                })
            })
            .collect(),
    )
}

/// Human-readable block titled "Web Search Results" used to augment the
/// user turn.
pub fn format_results_for_context(query: &str, results: &[SearchResult]) -> String {
    let mut out = format!("Web Search Results for \"{query}\":\n\n");
    for (i, result) in results.iter().enumerate() {
        out.push_str(&format!("{}. {} ({})\n", i + 1, result.title, result.url));
        if let Some(snippet) = &result.snippet {
            out.push_str(&format!("   {snippet}\n"));
        }
    }
    out
}
