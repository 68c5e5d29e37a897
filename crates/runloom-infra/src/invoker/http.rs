//! HTTP adapter for the tool-execution provider.
//!
//! Each call is `POST {base_url}/tools/{tool}/actions/{action}` with body
//! `{ connection_id, user_id, arguments }` and a bearer token. The provider
//! may wrap results as `{ "successful": bool, "data": ..., "error": ... }`;
//! an unwrapped JSON body is taken as the result itself.
//!
//! The token is held as a [`SecretString`] and never logged.

use std::time::Duration;

use runloom_core::workflow::invoker::{ActionInvoker, ActionRequest, InvokeError};
use runloom_types::config::ProviderConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;

use crate::config::ConfigError;

/// Longest error body kept in an [`InvokeError::Http`].
const MAX_ERROR_BODY: usize = 512;

pub struct HttpActionInvoker {
    client: reqwest::Client,
    base_url: String,
    token: SecretString,
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    connection_id: Option<&'a str>,
    user_id: &'a str,
    arguments: &'a Value,
}

impl HttpActionInvoker {
    pub fn new(
        base_url: impl Into<String>,
        token: SecretString,
        connect_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build from `[provider]` config, reading the token from the
    /// environment variable it names.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or(ConfigError::MissingBaseUrl)?;
        let token = std::env::var(&config.api_key_env)
            .map_err(|_| ConfigError::MissingToken(config.api_key_env.clone()))?;
        Self::new(
            base_url,
            SecretString::from(token),
            Duration::from_secs(config.connect_timeout_secs),
        )
    }

    fn endpoint(&self, request: &ActionRequest) -> String {
        format!(
            "{}/tools/{}/actions/{}",
            self.base_url, request.tool, request.action
        )
    }
}

impl ActionInvoker for HttpActionInvoker {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(&self, request: &ActionRequest) -> Result<Value, InvokeError> {
        let url = self.endpoint(request);
        let body = ExecuteBody {
            connection_id: request.connection_id.as_deref(),
            user_id: &request.user_id,
            arguments: &request.arguments,
        };

        tracing::debug!(tool = %request.tool, action = %request.action, "invoking provider");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.expose_secret())
            .timeout(Duration::from_millis(request.timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InvokeError::Timeout(request.timeout_ms)
                } else {
                    InvokeError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(InvokeError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| InvokeError::Provider(format!("invalid JSON response: {e}")))?;
        unwrap_envelope(payload)
    }
}

/// Unwrap a `{ successful, data, error }` envelope if present.
fn unwrap_envelope(payload: Value) -> Result<Value, InvokeError> {
    let Some(successful) = payload.get("successful").and_then(Value::as_bool) else {
        return Ok(payload);
    };
    if successful {
        return Ok(payload.get("data").cloned().unwrap_or(Value::Null));
    }
    let message = payload
        .get("error")
        .and_then(|e| e.as_str().map(str::to_string).or_else(|| Some(e.to_string())))
        .filter(|m| !m.is_empty() && m != "null")
        .unwrap_or_else(|| "action failed".to_string());
    Err(InvokeError::Provider(message))
}
