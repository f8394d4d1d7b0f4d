use std::time::Duration;

use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use crate::action::{Action, ActionResponse};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("endpoint returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Client for the single action endpoint. Every call is one POST whose body
/// is the action and whose response body is an [`ActionResponse`].
#[derive(Clone)]
pub struct ActionClient {
    http: Client,
    endpoint: Url,
    token: Option<String>,
}

impl ActionClient {
    pub fn new(endpoint: &str) -> Result<Self, ClientError> {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: Url::parse(endpoint)?,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn execute(&self, action: &Action) -> Result<ActionResponse, ClientError> {
        let mut request = self.http.post(self.endpoint.clone()).json(action);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    async fn handle_response(response: reqwest::Response) -> Result<ActionResponse, ClientError> {
        if response.status().is_success() {
            Ok(response.json::<ActionResponse>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ClientError::Api { status, body })
        }
    }
}

impl ClientError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ClientError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    /// Whether sending the same action again could succeed. Anything that
    /// never got an answer from the endpoint counts as retryable.
    pub fn is_retryable(&self) -> bool {
        match self.classification() {
            None => true,
            Some(class) => matches!(class, ApiErrorClass::RateLimit | ApiErrorClass::Transient),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Request(err) if err.is_timeout())
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}
