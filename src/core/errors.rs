use serde::{Deserialize, Serialize};

use super::types::Phase;

/// Error classification driving retry and outcome decisions.
///
/// `Transient` and `Quota` are retryable; everything else surfaces
/// immediately. `Timeout` is kept distinct from `Transient` because the
/// worker pool returns it without retrying (the caller decides whether a
/// fallback applies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    Transient,
    Quota,
    Schema,
    Permanent,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Quota)
    }
}

/// The one error type crossing component boundaries.
///
/// `code` is a stable machine-readable identifier; `message` is for humans;
/// `phase` is filled in by the orchestrator so callers learn the last phase
/// reached without parsing the message.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn new(kind: ErrorKind, code: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.to_string(),
            message: message.into(),
            phase: None,
        }
    }

    pub fn input(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Input, code, message)
    }

    pub fn transient(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, code, message)
    }

    pub fn quota(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Quota, code, message)
    }

    pub fn schema(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Schema, code, message)
    }

    pub fn permanent(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, code, message)
    }

    pub fn timeout(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, code, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled", "operation cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "internal", message)
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// SSL / connection-level failures the batch coordinator reacts to by
    /// collapsing concurrency to 1.
    pub fn is_transport(&self) -> bool {
        if !matches!(self.kind, ErrorKind::Transient | ErrorKind::Timeout) {
            return false;
        }
        matches!(
            self.code.as_str(),
            "net_connect" | "net_ssl" | "net_io" | "net_timeout"
        ) || {
            let m = self.message.to_ascii_lowercase();
            m.contains("ssl") || m.contains("handshake") || m.contains("connection")
        }
    }

    /// Map an HTTP status into the §7 taxonomy.
    pub fn from_http_status(status: u16, context: &str) -> Self {
        match status {
            429 => Self::quota("http_429", format!("{context}: rate limited (429)")),
            s if s >= 500 => {
                Self::transient("http_5xx", format!("{context}: server error ({s})"))
            }
            s if s >= 400 => {
                Self::permanent("http_4xx", format!("{context}: client error ({s})"))
            }
            s => Self::internal(format!("{context}: unexpected status {s}")),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::timeout("net_timeout", e.to_string());
        }
        if e.is_connect() {
            let msg = e.to_string();
            let code = if msg.to_ascii_lowercase().contains("ssl")
                || msg.to_ascii_lowercase().contains("tls")
            {
                "net_ssl"
            } else {
                "net_connect"
            };
            return Self::transient(code, msg);
        }
        if let Some(status) = e.status() {
            return Self::from_http_status(status.as_u16(), "http");
        }
        if e.is_builder() {
            return Self::input("bad_url", e.to_string());
        }
        Self::transient("net_io", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            EngineError::from_http_status(429, "llm").kind,
            ErrorKind::Quota
        );
        assert_eq!(
            EngineError::from_http_status(503, "llm").kind,
            ErrorKind::Transient
        );
        assert_eq!(
            EngineError::from_http_status(401, "llm").kind,
            ErrorKind::Permanent
        );
    }

    #[test]
    fn test_transport_detection() {
        let e = EngineError::transient("net_ssl", "TLS handshake failed");
        assert!(e.is_transport());

        let e = EngineError::transient("http_5xx", "server error (502)");
        assert!(!e.is_transport());

        let e = EngineError::permanent("http_4xx", "client error (404)");
        assert!(!e.is_transport());
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorKind::Transient.retryable());
        assert!(ErrorKind::Quota.retryable());
        assert!(!ErrorKind::Schema.retryable());
        assert!(!ErrorKind::Cancelled.retryable());
    }
}
