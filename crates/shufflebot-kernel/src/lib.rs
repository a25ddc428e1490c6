use std::future::Future;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use shufflebot_contracts::{
    ActionContext, Attachment, Integration, PostAction, SearchResult, ACTION_CANCEL, ACTION_SEND,
    ACTION_SHUFFLE,
};

/// Namespace for secret records in the shared key-value store.
pub const SECRET_KEY_PREFIX: &str = "token_";

/// Interactive posts stop working after this long.
pub const DEFAULT_SECRET_TTL_SECONDS: u64 = 30 * 60;

/// Upper bound on search calls made by a single shuffle.
pub const MAX_SHUFFLE_ATTEMPTS: usize = 3;

const SECRET_BYTES: usize = 32;

pub fn new_secret() -> String {
    let mut buf = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut buf);
    hex(&buf)
}

pub fn secret_key(scope: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    format!("{SECRET_KEY_PREFIX}{}", hex(&hasher.finalize()))
}

pub fn secrets_match(expected: &str, candidate: &str) -> bool {
    let (a, b) = (expected.as_bytes(), candidate.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Strips `/<trigger>` from a command line, returning the query text.
pub fn parse_command<'a>(trigger: &str, command: &'a str) -> Option<&'a str> {
    let rest = command.strip_prefix('/')?.strip_prefix(trigger)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim())
}

pub fn cancel_message(query: &str) -> String {
    format!("Cancelled giphy: \"{query}\"")
}

pub fn action_url(public_url: &str, action: &str) -> String {
    format!("{}/{action}", public_url.trim_end_matches('/'))
}

pub fn render_attachment(ctx: &ActionContext, public_url: &str, interactive: bool) -> Attachment {
    let mut attachment = Attachment {
        title: ctx.query.clone(),
        title_link: ctx.link_url.clone(),
        text: format!(
            "URL: {}\nPosted using [/giphy](https://www.giphy.com). ",
            ctx.link_url
        ),
        image_url: ctx.embed_url.clone(),
        actions: vec![],
    };
    if !interactive {
        return attachment;
    }

    let context = ctx.encode();
    attachment.actions = [
        ("Send", ACTION_SEND),
        ("Shuffle", ACTION_SHUFFLE),
        ("Cancel", ACTION_CANCEL),
    ]
    .into_iter()
    .map(|(name, action)| PostAction {
        id: uuid::Uuid::new_v4().as_simple().to_string(),
        name: name.to_string(),
        action_type: "button".to_string(),
        integration: Integration {
            url: action_url(public_url, action),
            context: context.clone(),
        },
    })
    .collect();
    attachment
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reshuffled {
    pub result: SearchResult,
    pub attempts: usize,
    pub changed: bool,
}

/// Fetches until the embed differs from `current` or the attempt bound is
/// hit; the last fetched result wins either way. Errors end the loop at once.
pub async fn reshuffle<F, Fut, E>(current: &SearchResult, mut fetch: F) -> Result<Reshuffled, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<SearchResult, E>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = fetch().await?;
        let changed = result.embed_url != current.embed_url;
        if changed || attempts >= MAX_SHUFFLE_ATTEMPTS {
            return Ok(Reshuffled {
                result,
                attempts,
                changed,
            });
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn res(id: &str) -> SearchResult {
        SearchResult {
            link_url: format!("https://giphy.com/gifs/{id}"),
            embed_url: format!("https://media.giphy.com/media/{id}/giphy.gif"),
        }
    }

    fn ctx() -> ActionContext {
        ActionContext {
            channel_id: "c1".to_string(),
            root_id: "r1".to_string(),
            parent_id: "r1".to_string(),
            query: "cats".to_string(),
            link_url: "L".to_string(),
            embed_url: "E".to_string(),
            secret: "abc".to_string(),
        }
    }

    async fn run(
        current: &SearchResult,
        script: Vec<Result<SearchResult, String>>,
    ) -> (Result<Reshuffled, String>, usize) {
        let mut queue: VecDeque<_> = script.into();
        let mut calls = 0;
        let out = reshuffle(current, || {
            calls += 1;
            let next = queue.pop_front().unwrap_or_else(|| Err("exhausted".to_string()));
            async move { next }
        })
        .await;
        (out, calls)
    }

    #[tokio::test]
    async fn reshuffle_retries_past_repeats() {
        let (out, calls) = run(&res("a"), vec![Ok(res("a")), Ok(res("a")), Ok(res("b"))]).await;
        let out = out.unwrap();
        assert_eq!(calls, 3);
        assert_eq!(out.result, res("b"));
        assert!(out.changed);
    }

    #[tokio::test]
    async fn reshuffle_settles_on_last_result_when_bound_exhausted() {
        let (out, calls) = run(
            &res("a"),
            vec![Ok(res("a")), Ok(res("a")), Ok(res("a")), Ok(res("z"))],
        )
        .await;
        let out = out.unwrap();
        assert_eq!(calls, MAX_SHUFFLE_ATTEMPTS);
        assert_eq!(out.attempts, MAX_SHUFFLE_ATTEMPTS);
        assert_eq!(out.result, res("a"));
        assert!(!out.changed);
    }

    #[tokio::test]
    async fn reshuffle_stops_on_first_new_result() {
        let (out, calls) = run(&res("a"), vec![Ok(res("b")), Ok(res("c"))]).await;
        assert_eq!(calls, 1);
        assert_eq!(out.unwrap().result, res("b"));
    }

    #[tokio::test]
    async fn reshuffle_does_not_retry_errors() {
        let (out, calls) = run(&res("a"), vec![Ok(res("a")), Err("boom".to_string())]).await;
        assert_eq!(calls, 2);
        assert_eq!(out.unwrap_err(), "boom");
    }

    #[test]
    fn secrets_are_random_hex() {
        let a = new_secret();
        let b = new_secret();
        assert_eq!(a.len(), SECRET_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn secret_key_is_namespaced_and_stable() {
        let k = secret_key("root-1");
        assert!(k.starts_with(SECRET_KEY_PREFIX));
        assert_eq!(k, secret_key("root-1"));
        assert_ne!(k, secret_key("root-2"));
    }

    #[test]
    fn secrets_match_is_exact() {
        assert!(secrets_match("abc", "abc"));
        assert!(!secrets_match("abc", "abd"));
        assert!(!secrets_match("abc", "ab"));
        assert!(!secrets_match("abc", ""));
    }

    #[test]
    fn parse_command_requires_trigger_boundary() {
        assert_eq!(parse_command("giphy", "/giphy  funny cats "), Some("funny cats"));
        assert_eq!(parse_command("giphy", "/giphy"), Some(""));
        assert_eq!(parse_command("giphy", "/giphyx cats"), None);
        assert_eq!(parse_command("giphy", "giphy cats"), None);
    }

    #[test]
    fn interactive_attachment_carries_context_on_every_button() {
        let a = render_attachment(&ctx(), "https://chat.example.com/plugins/gif/", true);
        assert_eq!(a.title, "cats");
        assert_eq!(a.image_url, "E");
        let names: Vec<_> = a.actions.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["Send", "Shuffle", "Cancel"]);
        assert_eq!(
            a.actions[1].integration.url,
            "https://chat.example.com/plugins/gif/shuffle"
        );
        for action in &a.actions {
            assert_eq!(ActionContext::decode(&action.integration.context).unwrap(), ctx());
        }
    }

    #[test]
    fn permanent_attachment_has_no_buttons() {
        let a = render_attachment(&ctx(), "https://x", false);
        assert!(a.actions.is_empty());
        assert!(!serde_json::to_string(&a).unwrap().contains("abc"));
    }
}
