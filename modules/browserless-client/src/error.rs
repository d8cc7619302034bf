use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrowserlessError>;

/// Status codes worth retrying: the request may succeed unchanged later.
pub const TRANSIENT_STATUS_CODES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum BrowserlessError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl BrowserlessError {
    /// Timeouts, connection resets and the transient status set.
    pub fn is_transient(&self) -> bool {
        match self {
            BrowserlessError::Timeout(_) | BrowserlessError::Connect(_) => true,
            BrowserlessError::Network(_) => true,
            BrowserlessError::Api { status, .. } => TRANSIENT_STATUS_CODES.contains(status),
            BrowserlessError::Parse(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            BrowserlessError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BrowserlessError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BrowserlessError::Timeout(err.to_string())
        } else if err.is_connect() {
            BrowserlessError::Connect(err.to_string())
        } else if err.is_decode() {
            BrowserlessError::Parse(err.to_string())
        } else {
            BrowserlessError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BrowserlessError {
    fn from(err: serde_json::Error) -> Self {
        BrowserlessError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_gateway_errors_are_transient() {
        for status in [429, 502, 503, 504] {
            let err = BrowserlessError::Api {
                status,
                message: String::new(),
            };
            assert!(err.is_transient(), "{status} should be transient");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 401, 403, 404] {
            let err = BrowserlessError::Api {
                status,
                message: String::new(),
            };
            assert!(!err.is_transient(), "{status} should be permanent");
        }
        assert!(!BrowserlessError::Parse("bad json".into()).is_transient());
    }
}
