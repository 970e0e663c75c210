use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("invalid push url: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("loki responded with {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to encode push payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PushError {
    /// Whether sending the same payload again may succeed.
    ///
    /// Network-level failures, `429 Too Many Requests` and `5xx` responses are
    /// transient; anything else means Loki rejected the payload for good.
    pub fn is_retryable(&self) -> bool {
        match self {
            PushError::Request(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            PushError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            PushError::InvalidUrl(_) | PushError::Encode(_) => false,
        }
    }
}
