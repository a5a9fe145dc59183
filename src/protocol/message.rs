//! Protocol messages and their XML form.
//!
//! | Root element     | Namespace                  | Variant                    |
//! |------------------|----------------------------|----------------------------|
//! | `<hello>`        | base:1.0                   | [`Message::Hello`]         |
//! | `<rpc>`          | base:1.0                   | [`Message::Rpc`]           |
//! | `<rpc-reply>`    | base:1.0                   | [`Message::RpcReply`]      |
//! | `<notification>` | notification:1.0 (RFC 5277)| [`Message::Notification`]  |
//!
//! Parsing is strict about the fields the session and dispatch layers rely
//! on (message-id, operation element, rpc-error structure, eventTime).
//! Payloads are kept as self-contained XML fragments (see
//! [`canonical_xml`](super::xml::canonical_xml)), so `parse(serialize(m))`
//! reproduces the same message.

use std::fmt::{self, Write};

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use roxmltree::Node;
use thiserror::Error;

use super::capabilities::CapabilitySet;
use super::rpc_error::{ErrorSeverity, ErrorTag, ErrorType, RpcError};
use super::xml::{
    canonical_xml, child, element_children, escape_attr, escape_text, parse_document,
    text_content,
};

/// NETCONF base namespace.
pub const BASE_NAMESPACE: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

/// Event notification namespace (RFC 5277).
pub const NOTIFICATION_NAMESPACE: &str = "urn:ietf:params:xml:ns:netconf:notification:1.0";

/// Frame content that is not a valid protocol message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Frame is not UTF-8
    #[error("Message is not valid UTF-8")]
    InvalidUtf8,

    /// Frame is not well-formed XML
    #[error("Malformed XML: {0}")]
    Xml(String),

    /// Root element is not a protocol message
    #[error("Unexpected root element <{name}> (namespace {namespace:?})")]
    UnknownRoot {
        /// Local name of the root element
        name: String,
        /// Its namespace, if any
        namespace: Option<String>,
    },

    /// rpc without a message-id attribute
    #[error("rpc has no message-id attribute")]
    MissingMessageId,

    /// rpc without an operation element
    #[error("rpc {message_id} carries no operation element")]
    MissingOperation {
        /// Message-id of the offending rpc
        message_id: String,
    },

    /// rpc with more than one operation element
    #[error("rpc {message_id} carries more than one operation element")]
    MultipleOperations {
        /// Message-id of the offending rpc
        message_id: String,
    },

    /// hello without a capabilities element
    #[error("hello has no capabilities element")]
    MissingCapabilities,

    /// session-id is not a positive integer
    #[error("Invalid session-id: {0:?}")]
    InvalidSessionId(String),

    /// notification without eventTime
    #[error("notification has no eventTime")]
    MissingEventTime,

    /// rpc-error lacking required fields
    #[error("Invalid rpc-error: {0}")]
    InvalidRpcError(String),
}

impl MessageError {
    /// Message-id to correlate an error reply with, when one was recovered.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::MissingOperation { message_id } | Self::MultipleOperations { message_id } => {
                Some(message_id)
            },
            _ => None,
        }
    }

    /// The rpc-error reported to the peer for this error.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::MissingMessageId => RpcError::missing_attribute("message-id", "rpc"),
            Self::MissingOperation { .. } => {
                RpcError::new(ErrorType::Protocol, ErrorTag::MissingElement)
                    .with_message(self.to_string())
                    .with_info("bad-element", "rpc")
            },
            _ => RpcError::malformed_message(self.to_string()),
        }
    }
}

impl From<roxmltree::Error> for MessageError {
    fn from(err: roxmltree::Error) -> Self {
        MessageError::Xml(err.to_string())
    }
}

/// Find a `message-id` attribute in bytes that failed to parse.
///
/// Best effort: lets a malformed-message reply carry the id when the
/// attribute itself is intact.
pub fn salvage_message_id(bytes: &[u8]) -> Option<String> {
    const ATTR: &str = "message-id=";
    let text = String::from_utf8_lossy(bytes);
    let start = text.find(ATTR)? + ATTR.len();
    let rest = &text[start..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    Some(rest[..end].to_string()).filter(|id| !id.is_empty())
}

/// Qualified operation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationName {
    /// Namespace URI
    pub namespace: Option<String>,
    /// Local name
    pub name: String,
}

impl OperationName {
    /// Create qualified name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Operation in the base namespace
    pub fn base(name: impl Into<String>) -> Self {
        Self::new(BASE_NAMESPACE, name)
    }

    /// Name without namespace; matches the local name in any namespace
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    fn of(node: Node<'_, '_>) -> Self {
        Self {
            namespace: node.tag_name().namespace().map(str::to_string),
            name: node.tag_name().name().to_string(),
        }
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{{{ns}}}{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// `<hello>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Advertised capabilities
    pub capabilities: CapabilitySet,
    /// Session id (server hello only)
    pub session_id: Option<u64>,
}

impl Hello {
    /// Create hello without session id
    pub fn new(capabilities: CapabilitySet) -> Self {
        Self {
            capabilities,
            session_id: None,
        }
    }

    /// Set session id
    pub fn with_session_id(mut self, session_id: u64) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// `<rpc>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    /// message-id attribute
    pub message_id: String,
    /// Qualified name of the operation element
    pub operation: OperationName,
    /// Operation element as a self-contained XML fragment
    pub content: String,
    /// Other attributes on `<rpc>`, echoed on the reply
    pub attributes: Vec<(String, String)>,
}

impl Rpc {
    /// Build an rpc from an operation element.
    ///
    /// An operation element without a namespace resolves to the base
    /// namespace, as it would inside `<rpc>` on the wire.
    pub fn new(message_id: impl Into<String>, operation_xml: &str) -> Result<Self, MessageError> {
        let message_id = message_id.into();
        let wrapped = format!("<rpc xmlns=\"{BASE_NAMESPACE}\">{operation_xml}</rpc>");
        let doc = parse_document(&wrapped)?;
        let operation = single_operation(doc.root_element(), &message_id)?;
        Ok(Self {
            message_id,
            operation: OperationName::of(operation),
            content: canonical_xml(operation),
            attributes: Vec::new(),
        })
    }

    /// Add an attribute on `<rpc>`
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }
}

/// Body of an `<rpc-reply>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyContent {
    /// `<ok/>`
    Ok,
    /// Data elements as an XML fragment
    Data(String),
    /// One or more `<rpc-error>`
    Errors(Vec<RpcError>),
}

/// `<rpc-reply>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    /// message-id of the rpc (absent only when the rpc had none)
    pub message_id: Option<String>,
    /// Attributes copied from the rpc
    pub attributes: Vec<(String, String)>,
    /// Reply body
    pub content: ReplyContent,
}

impl RpcReply {
    /// `<ok/>` reply
    pub fn ok(message_id: impl Into<String>) -> Self {
        Self::new(Some(message_id.into()), ReplyContent::Ok)
    }

    /// Data reply
    pub fn data(message_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(Some(message_id.into()), ReplyContent::Data(data.into()))
    }

    /// Error reply
    pub fn errors(message_id: Option<String>, errors: Vec<RpcError>) -> Self {
        Self::new(message_id, ReplyContent::Errors(errors))
    }

    fn new(message_id: Option<String>, content: ReplyContent) -> Self {
        Self {
            message_id,
            attributes: Vec::new(),
            content,
        }
    }

    /// Copy attributes (typically those of the rpc being answered)
    pub fn with_attributes(mut self, attributes: Vec<(String, String)>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Whether the reply carries no error-severity rpc-error
    pub fn is_ok(&self) -> bool {
        !self
            .rpc_errors()
            .iter()
            .any(|e| e.severity == ErrorSeverity::Error)
    }

    /// rpc-error elements in the reply
    pub fn rpc_errors(&self) -> &[RpcError] {
        match &self.content {
            ReplyContent::Errors(errors) => errors,
            _ => &[],
        }
    }
}

/// `<notification>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// eventTime as sent (RFC 3339)
    pub event_time: String,
    /// Event content as an XML fragment
    pub content: String,
}

impl Notification {
    /// Create notification stamped with the current time
    pub fn new(content: impl Into<String>) -> Self {
        Self::with_event_time(Utc::now(), content)
    }

    /// Create notification with an explicit event time
    pub fn with_event_time(event_time: DateTime<Utc>, content: impl Into<String>) -> Self {
        Self {
            event_time: event_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            content: content.into(),
        }
    }

    /// Parsed eventTime, if it is valid RFC 3339
    pub fn event_time(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(self.event_time.trim()).ok()
    }
}

/// A NETCONF protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Capability exchange
    Hello(Hello),
    /// Request
    Rpc(Rpc),
    /// Response
    RpcReply(RpcReply),
    /// Event
    Notification(Notification),
}

impl Message {
    /// Root element name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Rpc(_) => "rpc",
            Self::RpcReply(_) => "rpc-reply",
            Self::Notification(_) => "notification",
        }
    }

    /// Parse a framed message.
    pub fn parse(bytes: &[u8]) -> Result<Self, MessageError> {
        let text = std::str::from_utf8(bytes).map_err(|_| MessageError::InvalidUtf8)?;
        let doc = parse_document(text)?;
        let root = doc.root_element();

        match (root.tag_name().name(), root.tag_name().namespace()) {
            ("hello", None | Some(BASE_NAMESPACE)) => parse_hello(root).map(Self::Hello),
            ("rpc", None | Some(BASE_NAMESPACE)) => parse_rpc(root).map(Self::Rpc),
            ("rpc-reply", None | Some(BASE_NAMESPACE)) => {
                parse_rpc_reply(root).map(Self::RpcReply)
            },
            ("notification", Some(NOTIFICATION_NAMESPACE)) => {
                parse_notification(root).map(Self::Notification)
            },
            (name, namespace) => Err(MessageError::UnknownRoot {
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
            }),
        }
    }

    /// Serialize to XML.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        match self {
            Self::Hello(hello) => write_hello(hello, &mut out),
            Self::Rpc(rpc) => write_rpc(rpc, &mut out),
            Self::RpcReply(reply) => write_rpc_reply(reply, &mut out),
            Self::Notification(notification) => write_notification(notification, &mut out),
        }
        out
    }

    /// Serialize to bytes ready for framing.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_xml())
    }
}

impl From<Hello> for Message {
    fn from(hello: Hello) -> Self {
        Self::Hello(hello)
    }
}

impl From<Rpc> for Message {
    fn from(rpc: Rpc) -> Self {
        Self::Rpc(rpc)
    }
}

impl From<RpcReply> for Message {
    fn from(reply: RpcReply) -> Self {
        Self::RpcReply(reply)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

// Parsing

fn parse_hello(root: Node<'_, '_>) -> Result<Hello, MessageError> {
    let caps = child(root, "capabilities").ok_or(MessageError::MissingCapabilities)?;
    let capabilities = element_children(caps)
        .filter(|n| n.tag_name().name() == "capability")
        .map(text_content)
        .filter(|uri| !uri.trim().is_empty())
        .collect();

    let session_id = match child(root, "session-id") {
        Some(node) => {
            let raw = text_content(node);
            match raw.trim().parse::<u64>() {
                Ok(id) if id > 0 => Some(id),
                _ => return Err(MessageError::InvalidSessionId(raw)),
            }
        },
        None => None,
    };

    Ok(Hello {
        capabilities,
        session_id,
    })
}

fn parse_rpc(root: Node<'_, '_>) -> Result<Rpc, MessageError> {
    let message_id = root
        .attribute("message-id")
        .filter(|id| !id.is_empty())
        .ok_or(MessageError::MissingMessageId)?
        .to_string();
    let operation = single_operation(root, &message_id)?;

    Ok(Rpc {
        operation: OperationName::of(operation),
        content: canonical_xml(operation),
        attributes: extra_attributes(root),
        message_id,
    })
}

fn single_operation<'a, 'input>(
    rpc: Node<'a, 'input>,
    message_id: &str,
) -> Result<Node<'a, 'input>, MessageError> {
    let mut operations = element_children(rpc);
    let operation = operations
        .next()
        .ok_or_else(|| MessageError::MissingOperation {
            message_id: message_id.to_string(),
        })?;
    if operations.next().is_some() {
        return Err(MessageError::MultipleOperations {
            message_id: message_id.to_string(),
        });
    }
    Ok(operation)
}

fn parse_rpc_reply(root: Node<'_, '_>) -> Result<RpcReply, MessageError> {
    let message_id = root.attribute("message-id").map(str::to_string);

    let errors = element_children(root)
        .filter(|n| n.tag_name().name() == "rpc-error")
        .map(parse_rpc_error)
        .collect::<Result<Vec<_>, _>>()?;

    let content = if !errors.is_empty() {
        ReplyContent::Errors(errors)
    } else if child(root, "ok").is_some() {
        ReplyContent::Ok
    } else {
        ReplyContent::Data(element_children(root).map(canonical_xml).collect())
    };

    Ok(RpcReply {
        message_id,
        attributes: extra_attributes(root),
        content,
    })
}

fn parse_rpc_error(node: Node<'_, '_>) -> Result<RpcError, MessageError> {
    let field = |name: &str| child(node, name).map(|n| text_content(n).trim().to_string());

    let error_type = field("error-type")
        .ok_or_else(|| MessageError::InvalidRpcError("missing error-type".to_string()))?
        .parse::<ErrorType>()
        .map_err(MessageError::InvalidRpcError)?;
    let tag = field("error-tag")
        .filter(|t| !t.is_empty())
        .map(ErrorTag::from)
        .ok_or_else(|| MessageError::InvalidRpcError("missing error-tag".to_string()))?;
    let severity = match field("error-severity") {
        Some(s) => s
            .parse::<ErrorSeverity>()
            .map_err(MessageError::InvalidRpcError)?,
        None => ErrorSeverity::Error,
    };
    let info = child(node, "error-info")
        .map(|info| {
            element_children(info)
                .map(|n| (n.tag_name().name().to_string(), text_content(n)))
                .collect()
        })
        .unwrap_or_default();

    Ok(RpcError {
        error_type,
        tag,
        severity,
        app_tag: field("error-app-tag"),
        path: field("error-path"),
        message: child(node, "error-message").map(text_content),
        info,
    })
}

fn parse_notification(root: Node<'_, '_>) -> Result<Notification, MessageError> {
    let event_time = child(root, "eventTime")
        .map(|n| text_content(n).trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(MessageError::MissingEventTime)?;
    let content = element_children(root)
        .filter(|n| n.tag_name().name() != "eventTime")
        .map(canonical_xml)
        .collect();
    Ok(Notification {
        event_time,
        content,
    })
}

fn extra_attributes(node: Node<'_, '_>) -> Vec<(String, String)> {
    node.attributes()
        .filter(|a| a.namespace().is_none() && a.name() != "message-id")
        .map(|a| (a.name().to_string(), a.value().to_string()))
        .collect()
}

// Serialization

fn write_attributes(attributes: &[(String, String)], out: &mut String) {
    for (name, value) in attributes {
        let _ = write!(out, " {}=\"{}\"", name, escape_attr(value));
    }
}

fn write_hello(hello: &Hello, out: &mut String) {
    let _ = write!(out, "<hello xmlns=\"{BASE_NAMESPACE}\"><capabilities>");
    for cap in &hello.capabilities {
        let _ = write!(out, "<capability>{}</capability>", escape_text(cap.as_str()));
    }
    out.push_str("</capabilities>");
    if let Some(id) = hello.session_id {
        let _ = write!(out, "<session-id>{id}</session-id>");
    }
    out.push_str("</hello>");
}

fn write_rpc(rpc: &Rpc, out: &mut String) {
    let _ = write!(out, "<rpc message-id=\"{}\"", escape_attr(&rpc.message_id));
    write_attributes(&rpc.attributes, out);
    let _ = write!(out, " xmlns=\"{BASE_NAMESPACE}\">{}</rpc>", rpc.content);
}

fn write_rpc_reply(reply: &RpcReply, out: &mut String) {
    out.push_str("<rpc-reply");
    if let Some(id) = &reply.message_id {
        let _ = write!(out, " message-id=\"{}\"", escape_attr(id));
    }
    write_attributes(&reply.attributes, out);
    let _ = write!(out, " xmlns=\"{BASE_NAMESPACE}\">");
    match &reply.content {
        ReplyContent::Ok => out.push_str("<ok/>"),
        ReplyContent::Data(data) => out.push_str(data),
        ReplyContent::Errors(errors) => {
            for err in errors {
                write_rpc_error(err, out);
            }
        },
    }
    out.push_str("</rpc-reply>");
}

fn write_rpc_error(err: &RpcError, out: &mut String) {
    let _ = write!(
        out,
        "<rpc-error><error-type>{}</error-type><error-tag>{}</error-tag><error-severity>{}</error-severity>",
        err.error_type.as_str(),
        escape_text(err.tag.as_str()),
        err.severity.as_str()
    );
    if let Some(app_tag) = &err.app_tag {
        let _ = write!(out, "<error-app-tag>{}</error-app-tag>", escape_text(app_tag));
    }
    if let Some(path) = &err.path {
        let _ = write!(out, "<error-path>{}</error-path>", escape_text(path));
    }
    if let Some(message) = &err.message {
        let _ = write!(
            out,
            "<error-message xml:lang=\"en\">{}</error-message>",
            escape_text(message)
        );
    }
    if !err.info.is_empty() {
        out.push_str("<error-info>");
        for (name, value) in &err.info {
            let _ = write!(out, "<{name}>{}</{name}>", escape_text(value));
        }
        out.push_str("</error-info>");
    }
    out.push_str("</rpc-error>");
}

fn write_notification(notification: &Notification, out: &mut String) {
    let _ = write!(
        out,
        "<notification xmlns=\"{NOTIFICATION_NAMESPACE}\"><eventTime>{}</eventTime>{}</notification>",
        escape_text(&notification.event_time),
        notification.content
    );
}
