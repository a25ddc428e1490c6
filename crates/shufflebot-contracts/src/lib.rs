use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Header the host sets on every plugin request with the authenticated user.
pub const USER_ID_HEADER: &str = "Mattermost-User-Id";

pub const ACTION_SEND: &str = "send";
pub const ACTION_SHUFFLE: &str = "shuffle";
pub const ACTION_CANCEL: &str = "cancel";

const KEY_CHANNEL_ID: &str = "ChannelId";
const KEY_ROOT_ID: &str = "RootId";
const KEY_PARENT_ID: &str = "ParentId";
const KEY_QUERY: &str = "Query";
const KEY_LINK_URL: &str = "LinkURL";
const KEY_EMBED_URL: &str = "EmbedURL";
const KEY_SECRET: &str = "Secret";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("missing context field {0}")]
    Missing(&'static str),
    #[error("context field {0} is not a string")]
    NotAString(&'static str),
}

/// Round-trip state embedded in every button of an interactive post.
#[derive(Clone, PartialEq, Eq)]
pub struct ActionContext {
    pub channel_id: String,
    pub root_id: String,
    pub parent_id: String,
    pub query: String,
    pub link_url: String,
    pub embed_url: String,
    pub secret: String,
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("channel_id", &self.channel_id)
            .field("root_id", &self.root_id)
            .field("parent_id", &self.parent_id)
            .field("query", &self.query)
            .field("link_url", &self.link_url)
            .field("embed_url", &self.embed_url)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl ActionContext {
    /// Identity the interaction secret is stored under. Top-level invocations
    /// have no root post, so they fall back to the channel.
    pub fn secret_scope(&self) -> &str {
        secret_scope(&self.channel_id, &self.root_id)
    }

    /// Copy of this context showing a different result. Secret and thread
    /// coordinates are carried over unchanged.
    pub fn with_result(&self, result: &SearchResult) -> Self {
        Self {
            link_url: result.link_url.clone(),
            embed_url: result.embed_url.clone(),
            ..self.clone()
        }
    }

    pub fn result(&self) -> SearchResult {
        SearchResult {
            link_url: self.link_url.clone(),
            embed_url: self.embed_url.clone(),
        }
    }

    pub fn encode(&self) -> Map<String, Value> {
        let mut m = Map::new();
        for (key, value) in [
            (KEY_CHANNEL_ID, &self.channel_id),
            (KEY_ROOT_ID, &self.root_id),
            (KEY_PARENT_ID, &self.parent_id),
            (KEY_QUERY, &self.query),
            (KEY_LINK_URL, &self.link_url),
            (KEY_EMBED_URL, &self.embed_url),
            (KEY_SECRET, &self.secret),
        ] {
            m.insert(key.to_string(), Value::String(value.clone()));
        }
        m
    }

    pub fn decode(m: &Map<String, Value>) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: required_str(m, KEY_CHANNEL_ID)?,
            root_id: required_str(m, KEY_ROOT_ID)?,
            parent_id: required_str(m, KEY_PARENT_ID)?,
            query: required_str(m, KEY_QUERY)?,
            link_url: required_str(m, KEY_LINK_URL)?,
            embed_url: required_str(m, KEY_EMBED_URL)?,
            secret: required_str(m, KEY_SECRET)?,
        })
    }
}

pub fn secret_scope<'a>(channel_id: &'a str, root_id: &'a str) -> &'a str {
    if root_id.is_empty() {
        channel_id
    } else {
        root_id
    }
}

fn required_str(m: &Map<String, Value>, key: &'static str) -> Result<String, DecodeError> {
    match m.get(key) {
        None => Err(DecodeError::Missing(key)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(DecodeError::NotAString(key)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub link_url: String,
    pub embed_url: String,
}

/// Body the host posts when a user clicks an integration button.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRequest {
    #[serde(default)]
    pub user_id: String,
    pub post_id: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub ephemeral_text: String,
}

impl CallbackResponse {
    pub fn ack() -> Self {
        Self::default()
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            ephemeral_text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub user_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub root_id: String,
    #[serde(default)]
    pub parent_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub response_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl CommandResponse {
    pub fn ephemeral_text(text: impl Into<String>) -> Self {
        Self {
            response_type: "ephemeral".to_string(),
            text: text.into(),
            attachments: vec![],
        }
    }

    pub fn ephemeral_attachment(attachment: Attachment) -> Self {
        Self {
            response_type: "ephemeral".to_string(),
            text: String::new(),
            attachments: vec![attachment],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub title: String,
    pub title_link: String,
    pub text: String,
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<PostAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostAction {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub integration: Integration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub url: String,
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostKind {
    Default,
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub root_id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(rename = "type")]
    pub kind: PostKind,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub create_at: i64,
    #[serde(default)]
    pub update_at: i64,
}
