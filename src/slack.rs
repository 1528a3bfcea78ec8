// slack.rs
use anyhow::{Context, Result};
use reqwest::{header, Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

/// Thin Slack Web API client authenticated with the bot token.
#[derive(Debug, Clone)]
pub struct SlackClient {
    client: Client,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct UsersInfoResponse {
    user: SlackUser,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    #[serde(default)]
    name: String,
    #[serde(default)]
    profile: SlackProfile,
}

#[derive(Debug, Default, Deserialize)]
struct SlackProfile {
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct ConnectionsOpenResponse {
    url: String,
}

impl SlackClient {
    pub fn new(bot_token: &str, api_base: &str) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let mut auth = header::HeaderValue::from_str(&format!("Bearer {}", bot_token.trim()))
            .context("bot token is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static("snipe-bot/0.1"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build slack http client")?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }

    pub async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<()> {
        let mut payload = json!({
            "channel": channel,
            "text": text,
        });
        if let Some(thread_ts) = thread_ts {
            payload["thread_ts"] = Value::String(thread_ts.to_string());
        }

        let request = self.client.post(self.url("chat.postMessage")).json(&payload);
        self.call::<Value>("chat.postMessage", request).await?;

        Ok(())
    }

    pub async fn add_reaction(&self, channel: &str, timestamp: &str, name: &str) -> Result<()> {
        let payload = json!({
            "channel": channel,
            "timestamp": timestamp,
            "name": name,
        });

        let request = self.client.post(self.url("reactions.add")).json(&payload);
        self.call::<Value>("reactions.add", request).await?;

        Ok(())
    }

    /// Profile display name, or the account name when no display name is set.
    pub async fn user_display_name(&self, user_id: &str) -> Result<String> {
        let request = self
            .client
            .get(self.url("users.info"))
            .query(&[("user", user_id)]);
        let response: UsersInfoResponse = self.call("users.info", request).await?;

        let display_name = response.user.profile.display_name;
        if display_name.trim().is_empty() {
            Ok(response.user.name)
        } else {
            Ok(display_name)
        }
    }

    /// Asks for a Socket Mode websocket URL. Needs the app-level token, not
    /// the bot token.
    pub async fn open_socket_connection(&self, app_token: &str) -> Result<String> {
        let request = self
            .client
            .post(self.url("apps.connections.open"))
            .bearer_auth(app_token);
        let response: ConnectionsOpenResponse =
            self.call("apps.connections.open", request).await?;

        Ok(response.url)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("slack {} request failed", method))?;

        if !response.status().is_success() {
            anyhow::bail!("slack {} failed: {}", method, response.status());
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("slack {} returned invalid json", method))?;
        if !body["ok"].as_bool().unwrap_or(false) {
            anyhow::bail!(
                "slack {} failed: {}",
                method,
                body["error"].as_str().unwrap_or("unknown error")
            );
        }

        serde_json::from_value(body)
            .with_context(|| format!("unexpected slack {} response", method))
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn post_message_threads_and_authenticates() {
        let server = MockServer::start_async().await;
        let post = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat.postMessage")
                    .header("authorization", "Bearer xoxb-test")
                    .json_body(json!({
                        "channel": "C1",
                        "text": "hello",
                        "thread_ts": "12.34"
                    }));
                then.status(200).json_body(json!({"ok": true, "ts": "12.35"}));
            })
            .await;

        let client = SlackClient::new("xoxb-test", &server.base_url()).expect("client");
        client
            .post_message("C1", "hello", Some("12.34"))
            .await
            .expect("post");

        assert_eq!(post.calls_async().await, 1);
    }

    #[tokio::test]
    async fn api_level_error_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/reactions.add");
                then.status(200)
                    .json_body(json!({"ok": false, "error": "already_reacted"}));
            })
            .await;

        let client = SlackClient::new("xoxb-test", &server.base_url()).expect("client");
        let err = client
            .add_reaction("C1", "1.2", "white_check_mark")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("already_reacted"));
    }

    #[tokio::test]
    async fn http_error_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users.info");
                then.status(500);
            })
            .await;

        let client = SlackClient::new("xoxb-test", &server.base_url()).expect("client");
        let err = client.user_display_name("U1").await.unwrap_err();

        assert!(err.to_string().contains("users.info"));
    }

    #[tokio::test]
    async fn display_name_falls_back_to_account_name() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users.info").query_param("user", "U1");
                then.status(200).json_body(json!({
                    "ok": true,
                    "user": {"id": "U1", "name": "ada", "profile": {"display_name": ""}}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users.info").query_param("user", "U2");
                then.status(200).json_body(json!({
                    "ok": true,
                    "user": {"id": "U2", "name": "grace", "profile": {"display_name": "Grace H"}}
                }));
            })
            .await;

        let client = SlackClient::new("xoxb-test", &server.base_url()).expect("client");
        assert_eq!(client.user_display_name("U1").await.expect("U1"), "ada");
        assert_eq!(client.user_display_name("U2").await.expect("U2"), "Grace H");
    }

    #[tokio::test]
    async fn socket_connection_uses_app_token() {
        let server = MockServer::start_async().await;
        let open = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/apps.connections.open")
                    .header("authorization", "Bearer xapp-test");
                then.status(200)
                    .json_body(json!({"ok": true, "url": "wss://example.test/link"}));
            })
            .await;

        let client = SlackClient::new("xoxb-test", &server.base_url()).expect("client");
        let url = client
            .open_socket_connection("xapp-test")
            .await
            .expect("open");

        assert_eq!(url, "wss://example.test/link");
        assert_eq!(open.calls_async().await, 1);
    }
}
