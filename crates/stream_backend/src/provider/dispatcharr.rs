use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{id_to_string, BackendAdapter, BackendError, BackendType, Credentials, StreamSnapshot};

const UNKNOWN_NAME: &str = "Unknown Name";

pub struct DispatcharrBackend {
    server_url: String,
    credentials: Option<Credentials>,
    client: reqwest::Client,
    /// Bearer token of the current session, dropped whenever a poll fails
    access_token: RwLock<Option<String>>,
}

impl DispatcharrBackend {
    pub fn new(server_url: &str, credentials: Option<Credentials>) -> Result<Self, BackendError> {
        if credentials.is_none() {
            log::info!("No Dispatcharr credentials provided, requests will be anonymous");
        }
        Ok(Self {
            server_url: server_url.to_string(),
            credentials,
            client: super::http_client()?,
            access_token: RwLock::new(None),
        })
    }

    /// Returns the bearer token to use, logging in first if needed.
    async fn login(&self) -> Result<Option<String>, BackendError> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };
        if let Some(token) = self.access_token.read().await.clone() {
            return Ok(Some(token));
        }

        let url = format!("{}/api/accounts/token/", self.server_url);
        let password = credentials.password.clone().unwrap_or_default();
        let form = [
            ("username", credentials.username.as_str()),
            ("password", password.as_str()),
        ];
        let response = self.client.post(&url).form(&form).send().await?;
        match response.status() {
            reqwest::StatusCode::OK => {}
            reqwest::StatusCode::BAD_REQUEST | reqwest::StatusCode::UNAUTHORIZED => {
                return Err(BackendError::Auth("invalid credentials".to_string()));
            }
            status => return Err(BackendError::Status(status)),
        }
        let tokens: Value = response.json().await?;
        let token = tokens
            .get("access")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Auth("login response has no access token".to_string()))?
            .to_string();
        log::info!("Logged in to Dispatcharr as {}", credentials.username);
        *self.access_token.write().await = Some(token.clone());
        Ok(Some(token))
    }

    fn authorized(
        &self,
        request: reqwest::RequestBuilder,
        token: Option<String>,
    ) -> reqwest::RequestBuilder {
        let request = request.header("accept", "application/json");
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_status(&self) -> Result<Value, BackendError> {
        let token = self.login().await?;
        let url = format!("{}/proxy/ts/status", self.server_url);
        let response = self
            .authorized(self.client.get(&url), token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status()));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl BackendAdapter for DispatcharrBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Dispatcharr
    }

    fn stream_url_template(&self) -> String {
        format!("{}/proxy/ts/stream/{{id}}", self.server_url)
    }

    async fn list_active_streams(&self) -> Result<Vec<StreamSnapshot>, BackendError> {
        let status = match self.fetch_status().await {
            // expired token, log in again once within the same poll
            Err(BackendError::Status(status))
                if self.credentials.is_some()
                    && matches!(
                        status,
                        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN
                    ) =>
            {
                log::info!("Dispatcharr rejected the session ({status}), logging in again");
                self.access_token.write().await.take();
                self.fetch_status().await
            }
            other => other,
        };
        let result = status.and_then(|status| parse_proxy_status(&status));
        if result.is_err() {
            // Force a fresh login on the next poll
            self.access_token.write().await.take();
        }
        result
    }

    async fn switch_to_next(&self, stream_id: &str) -> Result<bool, BackendError> {
        let token = self.login().await?;
        let url = format!("{}/proxy/ts/next_stream/{}", self.server_url, stream_id);
        log::debug!("Requesting next stream: {url}");
        let response = self
            .authorized(self.client.post(&url), token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status()));
        }
        let result: Value = response.json().await?;
        Ok(switch_succeeded(&result))
    }
}

/// Normalise `/proxy/ts/status`, keeping only channels in the `active` state.
pub fn parse_proxy_status(status: &Value) -> Result<Vec<StreamSnapshot>, BackendError> {
    let channels = status
        .get("channels")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::Parse("status has no channels array".to_string()))?;

    Ok(channels
        .iter()
        .filter(|channel| channel.get("state").and_then(Value::as_str) == Some("active"))
        .filter_map(|channel| {
            let id = channel.get("channel_id").and_then(id_to_string)?;
            let name = channel
                .get("stream_name")
                .and_then(Value::as_str)
                .unwrap_or(UNKNOWN_NAME);
            let clients = channel
                .get("clients")
                .and_then(Value::as_array)
                .map(|clients| {
                    clients
                        .iter()
                        .map(|c| c.get("user_agent").and_then(Value::as_str).unwrap_or_default())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            Some(StreamSnapshot::new(&id, name, clients))
        })
        .collect())
}

/// Dispatcharr answers with a human readable `message`; an empty one, or an
/// explicit `success: false`, means nothing was switched.
pub fn switch_succeeded(result: &Value) -> bool {
    if result.get("success").and_then(Value::as_bool) == Some(false) {
        return false;
    }
    match result.get("message") {
        Some(Value::String(message)) => !message.trim().is_empty(),
        Some(Value::Null) | None => true,
        Some(_) => true,
    }
}
