//! Structured `<rpc-error>` content (RFC 6241 §4.3, Appendix A).
//!
//! [`RpcError`] is both what the engine emits for protocol problems and the
//! documented error type operation handlers return; either way it is
//! written to the peer field by field.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Layer the error occurred in (`error-type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    /// Secure transport layer
    Transport,
    /// Messages layer
    Rpc,
    /// Operations layer
    Protocol,
    /// Content layer
    Application,
}

impl ErrorType {
    /// Element body on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Rpc => "rpc",
            Self::Protocol => "protocol",
            Self::Application => "application",
        }
    }
}

impl FromStr for ErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "transport" => Ok(Self::Transport),
            "rpc" => Ok(Self::Rpc),
            "protocol" => Ok(Self::Protocol),
            "application" => Ok(Self::Application),
            other => Err(format!("Unknown error-type: {other}")),
        }
    }
}

/// Error severity (`error-severity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Error
    #[default]
    Error,
    /// Warning
    Warning,
}

impl ErrorSeverity {
    /// Element body on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }
}

impl FromStr for ErrorSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "error" => Ok(Self::Error),
            "warning" => Ok(Self::Warning),
            other => Err(format!("Unknown error-severity: {other}")),
        }
    }
}

/// Error condition (`error-tag`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ErrorTag {
    /// in-use
    InUse,
    /// invalid-value
    InvalidValue,
    /// too-big
    TooBig,
    /// missing-attribute
    MissingAttribute,
    /// bad-attribute
    BadAttribute,
    /// unknown-attribute
    UnknownAttribute,
    /// missing-element
    MissingElement,
    /// bad-element
    BadElement,
    /// unknown-element
    UnknownElement,
    /// unknown-namespace
    UnknownNamespace,
    /// access-denied
    AccessDenied,
    /// lock-denied
    LockDenied,
    /// resource-denied
    ResourceDenied,
    /// rollback-failed
    RollbackFailed,
    /// data-exists
    DataExists,
    /// data-missing
    DataMissing,
    /// operation-not-supported
    OperationNotSupported,
    /// operation-failed
    OperationFailed,
    /// malformed-message
    MalformedMessage,
    /// Tag outside the RFC 6241 list
    Other(String),
}

impl ErrorTag {
    /// Element body on the wire
    pub fn as_str(&self) -> &str {
        match self {
            Self::InUse => "in-use",
            Self::InvalidValue => "invalid-value",
            Self::TooBig => "too-big",
            Self::MissingAttribute => "missing-attribute",
            Self::BadAttribute => "bad-attribute",
            Self::UnknownAttribute => "unknown-attribute",
            Self::MissingElement => "missing-element",
            Self::BadElement => "bad-element",
            Self::UnknownElement => "unknown-element",
            Self::UnknownNamespace => "unknown-namespace",
            Self::AccessDenied => "access-denied",
            Self::LockDenied => "lock-denied",
            Self::ResourceDenied => "resource-denied",
            Self::RollbackFailed => "rollback-failed",
            Self::DataExists => "data-exists",
            Self::DataMissing => "data-missing",
            Self::OperationNotSupported => "operation-not-supported",
            Self::OperationFailed => "operation-failed",
            Self::MalformedMessage => "malformed-message",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for ErrorTag {
    fn from(s: String) -> Self {
        match s.trim() {
            "in-use" => Self::InUse,
            "invalid-value" => Self::InvalidValue,
            "too-big" => Self::TooBig,
            "missing-attribute" => Self::MissingAttribute,
            "bad-attribute" => Self::BadAttribute,
            "unknown-attribute" => Self::UnknownAttribute,
            "missing-element" => Self::MissingElement,
            "bad-element" => Self::BadElement,
            "unknown-element" => Self::UnknownElement,
            "unknown-namespace" => Self::UnknownNamespace,
            "access-denied" => Self::AccessDenied,
            "lock-denied" => Self::LockDenied,
            "resource-denied" => Self::ResourceDenied,
            "rollback-failed" => Self::RollbackFailed,
            "data-exists" => Self::DataExists,
            "data-missing" => Self::DataMissing,
            "operation-not-supported" => Self::OperationNotSupported,
            "operation-failed" => Self::OperationFailed,
            "malformed-message" => Self::MalformedMessage,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<ErrorTag> for String {
    fn from(tag: ErrorTag) -> Self {
        tag.as_str().to_string()
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `<rpc-error>` element.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{error_type:?}/{tag}: {}", .message.as_deref().unwrap_or("no message"))]
pub struct RpcError {
    /// error-type
    pub error_type: ErrorType,
    /// error-tag
    pub tag: ErrorTag,
    /// error-severity
    pub severity: ErrorSeverity,
    /// error-app-tag
    pub app_tag: Option<String>,
    /// error-path
    pub path: Option<String>,
    /// error-message
    pub message: Option<String>,
    /// error-info children, as element name and text content
    pub info: Vec<(String, String)>,
}

impl RpcError {
    /// Create error with type and tag, severity `error`
    pub fn new(error_type: ErrorType, tag: ErrorTag) -> Self {
        Self {
            error_type,
            tag,
            severity: ErrorSeverity::Error,
            app_tag: None,
            path: None,
            message: None,
            info: Vec::new(),
        }
    }

    /// Set error-message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set error-severity
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Set error-app-tag
    pub fn with_app_tag(mut self, app_tag: impl Into<String>) -> Self {
        self.app_tag = Some(app_tag.into());
        self
    }

    /// Set error-path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Add an error-info child
    pub fn with_info(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.push((name.into(), value.into()));
        self
    }

    /// Look up an error-info child by element name
    pub fn info(&self, name: &str) -> Option<&str> {
        self.info
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Frame could not be parsed as a protocol message.
    pub fn malformed_message(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Rpc, ErrorTag::MalformedMessage).with_message(message)
    }

    /// No handler is registered for the operation.
    pub fn operation_not_supported(operation: &str) -> Self {
        Self::new(ErrorType::Protocol, ErrorTag::OperationNotSupported)
            .with_message(format!("Operation {operation} is not supported"))
    }

    /// Handler failed without a more specific condition.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Application, ErrorTag::OperationFailed).with_message(message)
    }

    /// Required attribute is missing on an element.
    pub fn missing_attribute(attribute: &str, element: &str) -> Self {
        Self::new(ErrorType::Rpc, ErrorTag::MissingAttribute)
            .with_message(format!("Missing attribute {attribute} on {element}"))
            .with_info("bad-attribute", attribute)
            .with_info("bad-element", element)
    }

    /// Required element is missing.
    pub fn missing_element(element: &str) -> Self {
        Self::new(ErrorType::Protocol, ErrorTag::MissingElement)
            .with_message(format!("Missing element {element}"))
            .with_info("bad-element", element)
    }

    /// Parameter value is not acceptable.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Protocol, ErrorTag::InvalidValue).with_message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_tag_roundtrip() {
        for tag in ["malformed-message", "operation-not-supported", "lock-denied"] {
            assert_eq!(ErrorTag::from(tag.to_string()).as_str(), tag);
        }
        assert_eq!(
            ErrorTag::from("vendor-specific".to_string()),
            ErrorTag::Other("vendor-specific".to_string())
        );
    }

    #[test]
    fn test_type_and_severity_parse() {
        assert_eq!("rpc".parse::<ErrorType>().unwrap(), ErrorType::Rpc);
        assert!("bogus".parse::<ErrorType>().is_err());
        assert_eq!(
            " warning ".parse::<ErrorSeverity>().unwrap(),
            ErrorSeverity::Warning
        );
    }

    #[test]
    fn test_missing_attribute_info() {
        let err = RpcError::missing_attribute("message-id", "rpc");
        assert_eq!(err.error_type, ErrorType::Rpc);
        assert_eq!(err.tag, ErrorTag::MissingAttribute);
        assert_eq!(err.info("bad-attribute"), Some("message-id"));
        assert_eq!(err.info("bad-element"), Some("rpc"));
    }

    #[test]
    fn test_display() {
        let err = RpcError::operation_failed("disk full");
        assert_eq!(err.to_string(), "Application/operation-failed: disk full");
    }
}
