use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatTransport, MessageHandle};

const SLACK_API_BASE: &str = "https://slack.com/api";

/// Envelope every Slack Web API method answers with.
#[derive(Debug, Deserialize)]
pub struct SlackResponse {
    pub ok: bool,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SlackResponse {
    fn into_result(self, method: &str) -> Result<Self> {
        if self.ok {
            Ok(self)
        } else {
            bail!(
                "Slack {} failed: {}",
                method,
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    thread_ts: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateMessage<'a> {
    channel: &'a str,
    ts: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct AddReaction<'a> {
    channel: &'a str,
    timestamp: &'a str,
    name: &'a str,
}

/// Slack Web API client for the outbound half of the chat transport.
pub struct SlackClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
}

impl SlackClient {
    pub fn new(token: &str) -> Self {
        Self::with_api_base(token, SLACK_API_BASE)
    }

    pub fn with_api_base(token: &str, api_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn call<B: Serialize + ?Sized>(&self, method: &str, body: &B) -> Result<SlackResponse> {
        let url = format!("{}/{}", self.api_base, method);
        self.http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send Slack {} request", method))?
            .error_for_status()
            .with_context(|| format!("Slack {} returned error status", method))?
            .json::<SlackResponse>()
            .await
            .with_context(|| format!("Failed to parse Slack {} response", method))?
            .into_result(method)
    }
}

#[async_trait]
impl ChatTransport for SlackClient {
    async fn post_message(&self, channel: &str, thread: &str, text: &str) -> Result<()> {
        self.post_message_returning_handle(channel, thread, text)
            .await
            .map(|_| ())
    }

    async fn post_message_returning_handle(
        &self,
        channel: &str,
        thread: &str,
        text: &str,
    ) -> Result<MessageHandle> {
        let resp = self
            .call(
                "chat.postMessage",
                &PostMessage {
                    channel,
                    thread_ts: thread,
                    text,
                },
            )
            .await?;
        let ts = resp
            .ts
            .context("Slack chat.postMessage response had no ts")?;
        let channel = resp.channel.unwrap_or_else(|| channel.to_string());
        Ok(MessageHandle { channel, ts })
    }

    async fn update_message(&self, handle: &MessageHandle, text: &str) -> Result<()> {
        self.call(
            "chat.update",
            &UpdateMessage {
                channel: &handle.channel,
                ts: &handle.ts,
                text,
            },
        )
        .await
        .map(|_| ())
    }

    async fn add_reaction(&self, channel: &str, ts: &str, emoji: &str) -> Result<()> {
        match self
            .call(
                "reactions.add",
                &AddReaction {
                    channel,
                    timestamp: ts,
                    name: emoji,
                },
            )
            .await
        {
            Ok(_) => Ok(()),
            // Re-adding the same reaction is harmless.
            Err(e) if e.to_string().contains("already_reacted") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_ok_with_ts() {
        let json = r#"{"ok":true,"channel":"C1","ts":"1700000000.000100"}"#;
        let resp: SlackResponse = serde_json::from_str(json).unwrap();
        let resp = resp.into_result("chat.postMessage").unwrap();
        assert_eq!(resp.ts.as_deref(), Some("1700000000.000100"));
        assert_eq!(resp.channel.as_deref(), Some("C1"));
    }

    #[test]
    fn test_response_error_is_surfaced() {
        let json = r#"{"ok":false,"error":"channel_not_found"}"#;
        let resp: SlackResponse = serde_json::from_str(json).unwrap();
        let err = resp.into_result("chat.update").unwrap_err();
        assert!(err.to_string().contains("chat.update"));
        assert!(err.to_string().contains("channel_not_found"));
    }

    #[test]
    fn test_post_message_omits_empty_thread() {
        let body = PostMessage {
            channel: "C1",
            thread_ts: "",
            text: "hi",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("thread_ts").is_none());

        let body = PostMessage {
            channel: "C1",
            thread_ts: "111.222",
            text: "hi",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["thread_ts"], "111.222");
    }

    #[test]
    fn test_api_base_trailing_slash_is_trimmed() {
        let client = SlackClient::with_api_base("xoxb-test", "http://localhost:9999/api/");
        assert_eq!(client.api_base, "http://localhost:9999/api");
    }
}
