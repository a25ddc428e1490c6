use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::json;
use shufflebot_contracts::Post;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PostError(pub String);

/// Message operations the chat host exposes to integrations.
#[async_trait]
pub trait MessagePoster: Send + Sync {
    async fn create_post(&self, post: &Post) -> Result<Post, PostError>;
    async fn update_ephemeral(&self, user_id: &str, post: &Post) -> Result<(), PostError>;
    async fn delete_ephemeral(&self, user_id: &str, post_id: &str) -> Result<(), PostError>;
}

pub struct HostApiPoster {
    client: Client,
    api_url: Url,
    bot_token: Option<String>,
}

impl HostApiPoster {
    pub fn new(api_url: &str, bot_token: Option<String>, timeout_ms: u64) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        let api_url = Url::parse(api_url).map_err(|e| format!("invalid host api_url: {e}"))?;
        if api_url.cannot_be_a_base() {
            return Err(format!("invalid host api_url: {api_url}"));
        }
        Ok(Self {
            client,
            api_url,
            bot_token,
        })
    }

    /// Appends `segments` to the api url, one escaped path segment each.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, PostError> {
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || **s == "." || **s == "..")
        {
            return Err(PostError(format!("invalid path segment: {bad:?}")));
        }
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| PostError(format!("invalid host api_url: {}", self.api_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.bot_token {
            Some(token) if !token.is_empty() => builder.bearer_auth(token),
            _ => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, PostError> {
        let response = self
            .authed(builder)
            .send()
            .await
            .map_err(|e| PostError(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(PostError(format!("host api returned {status}: {detail}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl MessagePoster for HostApiPoster {
    async fn create_post(&self, post: &Post) -> Result<Post, PostError> {
        let url = self.endpoint(&["posts"])?;
        let response = self.send(self.client.post(url).json(post)).await?;
        response.json().await.map_err(|e| PostError(e.to_string()))
    }

    async fn update_ephemeral(&self, user_id: &str, post: &Post) -> Result<(), PostError> {
        let url = self.endpoint(&["posts", "ephemeral"])?;
        self.send(
            self.client
                .put(url)
                .json(&json!({"user_id": user_id, "post": post})),
        )
        .await?;
        Ok(())
    }

    async fn delete_ephemeral(&self, user_id: &str, post_id: &str) -> Result<(), PostError> {
        let url = self.endpoint(&["posts", "ephemeral", post_id])?;
        self.send(
            self.client
                .delete(url)
                .query(&[("user_id", user_id)]),
        )
        .await?;
        Ok(())
    }
}
