use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use shufflebot_contracts::SearchResult;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("{0}")]
    Transport(String),
    #[error("empty response, status:{0}")]
    Empty(u16),
    #[error("{0}")]
    Api(String),
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn query(
        &self,
        text: &str,
        rating: &str,
        api_key: &str,
    ) -> Result<SearchResult, SearchError>;
}

/// Giphy "translate" endpoint: one best-effort match per phrase.
pub struct GiphyClient {
    client: Client,
    endpoint: String,
}

impl GiphyClient {
    pub fn new(endpoint: &str, timeout_ms: u64) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl SearchClient for GiphyClient {
    async fn query(
        &self,
        text: &str,
        rating: &str,
        api_key: &str,
    ) -> Result<SearchResult, SearchError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("api_key", api_key),
                ("s", text),
                ("weirdness", "10"),
                ("rating", rating),
            ])
            .send()
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;
        parse_translate_response(&body, status)
    }
}

fn parse_translate_response(body: &Value, status: u16) -> Result<SearchResult, SearchError> {
    let Some(data) = body.get("data").and_then(Value::as_object) else {
        return match body.get("meta").and_then(|m| m.get("msg")) {
            Some(msg) => Err(SearchError::Api(
                msg.as_str().map_or_else(|| msg.to_string(), str::to_string),
            )),
            None => Err(SearchError::Empty(status)),
        };
    };

    let link_url = data
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| SearchError::Api("result has no url".to_string()))?;
    let id = match data.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(SearchError::Api("result has no id".to_string())),
    };

    Ok(SearchResult {
        link_url: link_url.to_string(),
        embed_url: format!("https://media.giphy.com/media/{id}/giphy.gif"),
    })
}
