use std::time::Duration;

use serde::Deserialize;

use crate::request::UploadRequest;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest slice of an unparseable error body kept in [`ViewerError::Rejected`]
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    /// Connection, TLS or protocol failure
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Non-2xx status, or a 2xx body carrying an error
    #[error("viewer rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed viewer response: {0}")]
    MalformedResponse(String),
}

impl ViewerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Rejected { .. } => "rejected",
            Self::MalformedResponse(_) => "malformed_response",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CreateResponse {
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl CreateResponse {
    fn error_message(&self) -> Option<&str> {
        self.error.as_deref().or(self.message.as_deref())
    }
}

/// HTTP client for the media viewer's `/create` endpoint
#[derive(Debug, Clone)]
pub struct ViewerClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ViewerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST the request and return the viewer's `file_id`
    pub async fn create(&self, req: &UploadRequest) -> Result<String, ViewerError> {
        let url = format!("{}/create", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| self.transport_error(e))?;
        parse_create_response(status, &body)
    }

    fn transport_error(&self, err: reqwest::Error) -> ViewerError {
        if err.is_timeout() {
            ViewerError::Timeout(self.timeout)
        } else {
            ViewerError::Transport(err.without_url().to_string())
        }
    }
}

/// Interpret a `/create` response
pub fn parse_create_response(status: u16, body: &str) -> Result<String, ViewerError> {
    let parsed = serde_json::from_str::<CreateResponse>(body);

    if !(200..300).contains(&status) {
        let message = match &parsed {
            Ok(resp) => resp.error_message().map(str::to_string),
            Err(_) => None,
        }
        .unwrap_or_else(|| truncate(body.trim(), MAX_ERROR_BODY).to_string());
        return Err(ViewerError::Rejected { status, message });
    }

    let resp = parsed.map_err(|e| ViewerError::MalformedResponse(e.to_string()))?;
    if let Some(message) = resp.error_message() {
        return Err(ViewerError::Rejected {
            status,
            message: message.to_string(),
        });
    }
    match resp.file_id {
        Some(file_id) if is_valid_file_id(&file_id) => Ok(file_id),
        Some(_) => Err(ViewerError::MalformedResponse(
            "file_id is not a valid path segment".to_string(),
        )),
        None => Err(ViewerError::MalformedResponse(
            "missing file_id".to_string(),
        )),
    }
}

fn is_valid_file_id(file_id: &str) -> bool {
    !file_id.is_empty()
        && file_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
