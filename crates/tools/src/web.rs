//! Web search via the DuckDuckGo instant-answer API (keyless).

use sp_domain::error::{Error, Result};

const DEFAULT_ENDPOINT: &str = "https://api.duckduckgo.com/";

pub struct WebSearchClient {
    client: reqwest::Client,
    endpoint: String,
}

impl WebSearchClient {
    pub fn new(timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: DEFAULT_ENDPOINT.into(),
        })
    }

    /// Point at a different endpoint (tests, self-hosted instances).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Run a search and format results as a numbered list.
    pub async fn search(&self, query: &str, num_results: usize) -> Result<String> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("web search: {e}"))
                } else {
                    Error::Http(format!("web search: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Http(format!("web search HTTP {}", status.as_u16())));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Http(format!("web search body: {e}")))?;

        Ok(format_results(&body, num_results))
    }
}

fn format_results(body: &serde_json::Value, num_results: usize) -> String {
    let mut results: Vec<(String, String, String)> = Vec::new();

    // The abstract, when present, is the best single answer.
    if let Some(text) = body.get("AbstractText").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            results.push((
                body.get("Heading")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Summary")
                    .to_string(),
                body.get("AbstractURL")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                text.to_string(),
            ));
        }
    }

    if let Some(topics) = body.get("RelatedTopics").and_then(|v| v.as_array()) {
        for topic in topics {
            // Grouped topics nest one level deeper.
            let items: Vec<&serde_json::Value> = match topic.get("Topics").and_then(|v| v.as_array())
            {
                Some(nested) => nested.iter().collect(),
                None => vec![topic],
            };
            for item in items {
                let text = item.get("Text").and_then(|v| v.as_str()).unwrap_or("");
                let url = item.get("FirstURL").and_then(|v| v.as_str()).unwrap_or("");
                if !text.is_empty() {
                    let title = text.split(" - ").next().unwrap_or(text).to_string();
                    results.push((title, url.to_string(), text.to_string()));
                }
            }
        }
    }

    results.truncate(num_results.max(1));

    if results.is_empty() {
        return "No results found".into();
    }

    results
        .iter()
        .enumerate()
        .map(|(i, (title, url, snippet))| format!("{}. {title}\n   URL: {url}\n   {snippet}", i + 1))
        .collect::<Vec<_>>()
        .join("\n\n")
}
