pub mod poster;
pub mod search;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use shufflebot_config::{validate_runtime_support, Config, ConfigError};
use shufflebot_contracts::{
    secret_scope, ActionContext, Attachment, CallbackRequest, CallbackResponse, CommandRequest,
    CommandResponse, DecodeError, Post, PostKind, ACTION_CANCEL, ACTION_SEND, ACTION_SHUFFLE,
    USER_ID_HEADER,
};
use shufflebot_kernel::{cancel_message, parse_command, render_attachment, reshuffle};
use thiserror::Error;
use tokio::sync::watch;

pub use poster::{HostApiPoster, MessagePoster, PostError};
pub use search::{GiphyClient, SearchClient, SearchError};
pub use store::{KvStore, MemoryKv, SecretStore, SqliteKv, StoreError};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(&cfg)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, public_url = %cfg.server.public_url, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub fn build_app(cfg: &Config) -> Result<Router, String> {
    Ok(router(AppState::new(cfg)?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/command", post(command))
        .route("/send", post(send))
        .route("/shuffle", post(shuffle))
        .route("/cancel", post(cancel))
        .with_state(state)
}

/// Hot-swappable part of the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub trigger: String,
    pub rating: String,
    pub api_key: String,
    pub public_url: String,
}

impl Settings {
    fn from_config(cfg: &Config) -> Self {
        Self {
            trigger: cfg.command.trigger.clone(),
            rating: cfg.search.rating.clone(),
            api_key: cfg.search.api_key.clone(),
            public_url: cfg.server.public_url.clone(),
        }
    }
}

pub struct Collaborators {
    pub kv: Arc<dyn KvStore>,
    pub search: Arc<dyn SearchClient>,
    pub poster: Arc<dyn MessagePoster>,
}

#[derive(Clone)]
pub struct AppState {
    settings: Arc<watch::Sender<Arc<Settings>>>,
    secrets: SecretStore,
    search: Arc<dyn SearchClient>,
    poster: Arc<dyn MessagePoster>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing acting user")]
    MissingUser,
    #[error("malformed callback body: {0}")]
    MalformedBody(String),
    #[error("callback has no context")]
    MissingContext,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("secret mismatch or expired")]
    SecretRejected,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            AuthError::MissingUser => "missing_user",
            AuthError::MalformedBody(_) => "malformed_body",
            AuthError::MissingContext => "missing_context",
            AuthError::Decode(_) => "context_decode_failed",
            AuthError::SecretRejected => "secret_rejected",
            AuthError::Store(_) => "secret_store_error",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        StatusCode::BAD_REQUEST.into_response()
    }
}

/// A callback that passed every check. `context` is exactly what was embedded
/// in the button; `channel_id` is where effects land.
#[derive(Debug, Clone)]
pub struct AuthorizedCallback {
    pub acting_user: String,
    pub post_id: String,
    pub channel_id: String,
    pub context: ActionContext,
}

pub async fn authorize_callback(
    secrets: &SecretStore,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<AuthorizedCallback, AuthError> {
    let acting_user = acting_user(headers).ok_or(AuthError::MissingUser)?;
    let request: CallbackRequest =
        serde_json::from_slice(body).map_err(|e| AuthError::MalformedBody(e.to_string()))?;
    let raw = request.context.as_ref().ok_or(AuthError::MissingContext)?;
    let context = ActionContext::decode(raw)?;

    if !secrets
        .verify(context.secret_scope(), &context.secret)
        .await?
    {
        return Err(AuthError::SecretRejected);
    }

    let channel_id = if request.channel_id.is_empty() {
        context.channel_id.clone()
    } else {
        request.channel_id
    };
    Ok(AuthorizedCallback {
        acting_user,
        post_id: request.post_id,
        channel_id,
        context,
    })
}

fn acting_user(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl AppState {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let kv: Arc<dyn KvStore> = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            Arc::new(SqliteKv::open(&sqlite_path)?)
        } else {
            Arc::new(MemoryKv::default())
        };
        Ok(Self::from_parts(
            cfg,
            Collaborators {
                kv,
                search: Arc::new(GiphyClient::new(
                    &cfg.search.endpoint,
                    cfg.search.timeout_ms,
                )?),
                poster: Arc::new(HostApiPoster::new(
                    &cfg.host.api_url,
                    cfg.host.bot_token.clone(),
                    cfg.host.timeout_ms,
                )?),
            },
        ))
    }

    pub fn from_parts(cfg: &Config, parts: Collaborators) -> Self {
        let (settings, _) = watch::channel(Arc::new(Settings::from_config(cfg)));
        Self {
            settings: Arc::new(settings),
            secrets: SecretStore::new(parts.kv, cfg.secrets.ttl_seconds),
            search: parts.search,
            poster: parts.poster,
        }
    }

    /// Consistent snapshot of the current settings.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings.borrow().clone()
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    /// Validates `cfg` and publishes it as the new settings snapshot. On error
    /// the previous snapshot stays in effect.
    pub fn reconfigure(&self, cfg: &Config) -> Result<(), ConfigError> {
        validate_runtime_support(cfg)?;
        let next = Settings::from_config(cfg);
        tracing::info!(trigger = %next.trigger, rating = %next.rating, "settings updated");
        self.settings.send_replace(Arc::new(next));
        Ok(())
    }

    async fn authorize(
        &self,
        action: &'static str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<AuthorizedCallback, AuthError> {
        authorize_callback(&self.secrets, headers, body)
            .await
            .inspect_err(|err| {
                tracing::warn!(action, reason = err.reason_code(), error = %err, "rejected callback");
            })
    }

    pub async fn execute_command(&self, request: &CommandRequest) -> CommandResponse {
        let settings = self.settings();
        let Some(query) = parse_command(&settings.trigger, &request.text) else {
            return CommandResponse::ephemeral_text(format!("Invalid command: {}", request.text));
        };

        let result = match self
            .search
            .query(query, &settings.rating, &settings.api_key)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "search failed");
                return CommandResponse::ephemeral_text(format!("Giphy API error: {err}"));
            }
        };

        let scope = secret_scope(&request.channel_id, &request.root_id);
        let secret = match self.secrets.mint(scope).await {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(error = %err, "failed to mint secret");
                return CommandResponse::ephemeral_text(format!("Error: {err}"));
            }
        };

        let context = ActionContext {
            channel_id: request.channel_id.clone(),
            root_id: request.root_id.clone(),
            parent_id: request.parent_id.clone(),
            query: query.to_string(),
            link_url: result.link_url,
            embed_url: result.embed_url,
            secret,
        };
        CommandResponse::ephemeral_attachment(render_attachment(
            &context,
            &settings.public_url,
            true,
        ))
    }

    /// Replaces the preview with a permanent in-thread post.
    pub async fn commit(&self, cb: &AuthorizedCallback) -> CallbackResponse {
        if let Err(err) = self
            .poster
            .delete_ephemeral(&cb.acting_user, &cb.post_id)
            .await
        {
            tracing::error!(action = ACTION_SEND, error = %err, "failed to remove preview");
            return CallbackResponse::text(format!("Error: {err}"));
        }

        let settings = self.settings();
        let ctx = &cb.context;
        let post = Post {
            id: String::new(),
            user_id: cb.acting_user.clone(),
            channel_id: cb.channel_id.clone(),
            root_id: ctx.root_id.clone(),
            parent_id: ctx.parent_id.clone(),
            kind: PostKind::Default,
            message: String::new(),
            attachments: vec![render_attachment(ctx, &settings.public_url, false)],
            create_at: 0,
            update_at: 0,
        };
        match self.poster.create_post(&post).await {
            Ok(created) => {
                tracing::info!(post_id = %created.id, channel_id = %cb.channel_id, "result committed");
                CallbackResponse::ack()
            }
            Err(err) => {
                tracing::error!(action = ACTION_SEND, error = %err, "failed to create post");
                CallbackResponse::text(format!("Error: {err}"))
            }
        }
    }

    /// Swaps the preview for another result of the same query.
    pub async fn reshuffle(&self, cb: &AuthorizedCallback) -> CallbackResponse {
        let settings = self.settings();
        let search = self.search.as_ref();
        let (query, rating, api_key) = (
            cb.context.query.as_str(),
            settings.rating.as_str(),
            settings.api_key.as_str(),
        );

        let shuffled =
            match reshuffle(&cb.context.result(), || search.query(query, rating, api_key)).await {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(action = ACTION_SHUFFLE, error = %err, "search failed");
                    return CallbackResponse::text(format!("Giphy API error: {err}"));
                }
            };
        tracing::debug!(
            attempts = shuffled.attempts,
            changed = shuffled.changed,
            "reshuffled"
        );

        let context = cb.context.with_result(&shuffled.result);
        let post = ephemeral_post(
            cb,
            String::new(),
            vec![render_attachment(&context, &settings.public_url, true)],
        );
        match self.poster.update_ephemeral(&cb.acting_user, &post).await {
            Ok(()) => CallbackResponse::ack(),
            Err(err) => {
                tracing::error!(action = ACTION_SHUFFLE, error = %err, "failed to update preview");
                CallbackResponse::text(format!("Error: {err}"))
            }
        }
    }

    pub async fn cancel(&self, cb: &AuthorizedCallback) -> CallbackResponse {
        let post = ephemeral_post(cb, cancel_message(&cb.context.query), vec![]);
        match self.poster.update_ephemeral(&cb.acting_user, &post).await {
            Ok(()) => CallbackResponse::ack(),
            Err(err) => {
                tracing::error!(action = ACTION_CANCEL, error = %err, "failed to update preview");
                CallbackResponse::text(format!("Error: {err}"))
            }
        }
    }
}

fn ephemeral_post(cb: &AuthorizedCallback, message: String, attachments: Vec<Attachment>) -> Post {
    let now = Utc::now().timestamp_millis();
    Post {
        id: cb.post_id.clone(),
        user_id: cb.acting_user.clone(),
        channel_id: cb.channel_id.clone(),
        root_id: cb.context.root_id.clone(),
        parent_id: cb.context.parent_id.clone(),
        kind: PostKind::Ephemeral,
        message,
        attachments,
        create_at: now,
        update_at: now,
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn command(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if acting_user(&headers).is_none() {
        tracing::warn!(reason = "missing_user", "rejected command");
        return StatusCode::BAD_REQUEST.into_response();
    }
    let request: CommandRequest = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(reason = "malformed_body", error = %err, "rejected command");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    Json(state.execute_command(&request).await).into_response()
}

async fn send(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackResponse>, AuthError> {
    let cb = state.authorize(ACTION_SEND, &headers, &body).await?;
    Ok(Json(state.commit(&cb).await))
}

async fn shuffle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackResponse>, AuthError> {
    let cb = state.authorize(ACTION_SHUFFLE, &headers, &body).await?;
    Ok(Json(state.reshuffle(&cb).await))
}

async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackResponse>, AuthError> {
    let cb = state.authorize(ACTION_CANCEL, &headers, &body).await?;
    Ok(Json(state.cancel(&cb).await))
}
