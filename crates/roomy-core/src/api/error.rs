use thiserror::Error;

/// Failure talking to the keyserver
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Keyserver rejected the access token")]
    Unauthorized,

    #[error("Keyserver refused the request: {0}")]
    Forbidden(String),

    #[error("No passphrase found for this account")]
    NoPassphrase,

    #[error("Keyserver is rate limiting requests")]
    RateLimited,

    #[error("Keyserver error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected keyserver response: {0}")]
    InvalidResponse(String),
}

/// Longest response body carried into an error message
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let cut = (0..=MAX_ERROR_BODY_LENGTH)
            .rev()
            .find(|&i| body.is_char_boundary(i))
            .unwrap_or(0);
        format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::Forbidden(Self::truncate_body(body)),
            404 => ApiError::NoPassphrase,
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(Self::truncate_body(body)),
            _ => ApiError::InvalidResponse(format!(
                "Status {}: {}",
                status,
                Self::truncate_body(body)
            )),
        }
    }

    /// Whether the same request may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited | ApiError::ServerError(_) | ApiError::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, ""),
            ApiError::Unauthorized
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::FORBIDDEN, "nope"),
            ApiError::Forbidden(body) if body == "nope"
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::NOT_FOUND, ""),
            ApiError::NoPassphrase
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::IM_A_TEAPOT, ""),
            ApiError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(ApiError::from_status(StatusCode::BAD_GATEWAY, "upstream").is_retryable());
        assert!(ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!ApiError::from_status(StatusCode::UNAUTHORIZED, "").is_retryable());
        assert!(!ApiError::NoPassphrase.is_retryable());
    }

    #[test]
    fn test_long_body_is_truncated_on_char_boundary() {
        let body = "é".repeat(400);
        let message = ApiError::truncate_body(&body);
        assert!(message.contains("truncated, 800 total bytes"));
        assert!(message.starts_with(&"é".repeat(250)));
    }
}
