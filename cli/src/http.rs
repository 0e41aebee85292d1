//! `reqwest` implementation of the sync transport and profile API.

use std::time::Duration;

use async_trait::async_trait;
use huddle_engine::SyncTransport;
use huddle_protocol::SyncKind;
use huddle_protocol::SyncQueueItem;
use huddle_protocol::UserPreferences;
use huddle_reconcile::CreateProfileRequest;
use huddle_reconcile::ProfileApi;
use huddle_retry::RequestError;
use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use tracing::debug;

/// Talks to the onboarding API under `base_url`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    /// Used for profile calls; queue sends receive the token per call.
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn route(kind: SyncKind) -> (Method, &'static str) {
        match kind {
            SyncKind::StepUpdate => (Method::POST, "/onboarding/step"),
            SyncKind::Completion => (Method::POST, "/onboarding/complete"),
            SyncKind::PreferenceUpdate => (Method::PUT, "/users/preferences"),
        }
    }

    fn authorized(&self, builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

async fn dispatch(builder: RequestBuilder) -> Result<Response, RequestError> {
    builder.send().await.map_err(|e| {
        if e.is_timeout() {
            RequestError::new(format!("request timed out: {e}"))
        } else {
            RequestError::network(e)
        }
    })
}

/// Map a non-success response to a classified error.
async fn status_error(response: Response) -> RequestError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    } else {
        body
    };
    let err = RequestError::http(status.as_u16(), message);
    match retry_after {
        Some(delay) => err.with_retry_after(delay),
        None => err,
    }
}

#[async_trait]
impl SyncTransport for HttpBackend {
    async fn send(&self, item: &SyncQueueItem, token: &str) -> Result<(), RequestError> {
        let (method, path) = Self::route(item.kind);
        let builder = self
            .client
            .request(method, self.url(path))
            .header("X-Idempotency-Key", item.id.as_str())
            .json(&item.payload);
        let response = dispatch(self.authorized(builder, Some(token))).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        debug!(id = %item.id, kind = %item.kind, "sync item delivered");
        Ok(())
    }
}

#[async_trait]
impl ProfileApi for HttpBackend {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<UserPreferences>, RequestError> {
        let builder = self
            .client
            .get(self.url(&format!("/users/{user_id}/preferences")));
        let response = dispatch(self.authorized(builder, self.token.as_deref())).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json::<UserPreferences>()
            .await
            .map(Some)
            .map_err(|e| RequestError::new(format!("invalid profile response: {e}")))
    }

    async fn create_profile(
        &self,
        request: &CreateProfileRequest,
    ) -> Result<UserPreferences, RequestError> {
        let builder = self.client.post(self.url("/users/preferences")).json(request);
        let response = dispatch(self.authorized(builder, self.token.as_deref())).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json::<UserPreferences>()
            .await
            .map_err(|e| RequestError::new(format!("invalid profile response: {e}")))
    }
}
