//! Operation handlers and the chain interpreter.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::protocol::xml::{child, parse_document, text_content};
use crate::protocol::{OperationName, Rpc, RpcError};

/// Successful handler result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    /// Replied as `<ok/>`
    Ok,
    /// Replied as data elements
    Data(String),
}

/// Documented handler failure, replied as one `<rpc-error>` per entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
pub struct OperationError(pub Vec<RpcError>);

impl From<RpcError> for OperationError {
    fn from(err: RpcError) -> Self {
        Self(vec![err])
    }
}

/// Handler outcome
pub type OperationResult = std::result::Result<OperationOutput, OperationError>;

/// Future returned by handlers
pub type OperationFuture<'a> = Pin<Box<dyn Future<Output = OperationResult> + Send + 'a>>;

/// An inbound operation as handed to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    /// Session the rpc arrived on
    pub session_id: u64,
    /// message-id of the rpc
    pub message_id: String,
    /// Qualified operation name
    pub operation: OperationName,
    /// Operation element as an XML fragment
    pub content: String,
}

impl OperationRequest {
    /// Build from a parsed rpc
    pub fn from_rpc(session_id: u64, rpc: &Rpc) -> Self {
        Self {
            session_id,
            message_id: rpc.message_id.clone(),
            operation: rpc.operation.clone(),
            content: rpc.content.clone(),
        }
    }

    /// Trimmed text of a direct child of the operation element.
    pub fn parameter(&self, name: &str) -> Result<Option<String>, RpcError> {
        let doc = parse_document(&self.content)
            .map_err(|e| RpcError::malformed_message(e.to_string()))?;
        Ok(child(doc.root_element(), name).map(|n| text_content(n).trim().to_string()))
    }
}

/// Operation handler.
///
/// `previous` is the output of the handler before this one when several
/// handlers are chained on one operation, `None` for the first.
pub trait OperationHandler: Send + Sync {
    /// Execute the operation
    fn handle<'a>(
        &'a self,
        request: &'a OperationRequest,
        previous: Option<OperationOutput>,
    ) -> OperationFuture<'a>;
}

/// Handler backed by a closure returning an owned future.
pub struct FnHandler<F>(F);

/// Wrap a closure as an [`OperationHandler`].
///
/// ```rust,ignore
/// registry.register(
///     OperationName::base("get"),
///     handler_fn(|_req, _prev| async {
///         OperationResult::Ok(OperationOutput::Data("<data/>".into()))
///     }),
/// );
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(OperationRequest, Option<OperationOutput>) -> Fut + Send + Sync,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    FnHandler(f)
}

impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(OperationRequest, Option<OperationOutput>) -> Fut + Send + Sync,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        request: &'a OperationRequest,
        previous: Option<OperationOutput>,
    ) -> OperationFuture<'a> {
        Box::pin((self.0)(request.clone(), previous))
    }
}

type Chain = Vec<Arc<dyn OperationHandler>>;

/// Maps operation names to handler chains.
///
/// Built at startup, then shared read-only by every session. Lookup tries
/// the exact qualified name first, then a registration by local name.
#[derive(Default)]
pub struct OperationRegistry {
    chains: HashMap<OperationName, Chain>,
    terminal: HashSet<String>,
}

impl OperationRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the chain for `name`
    pub fn register(&mut self, name: OperationName, handler: impl OperationHandler + 'static) {
        self.register_arc(name, Arc::new(handler));
    }

    /// Append a shared handler to the chain for `name`
    pub fn register_arc(&mut self, name: OperationName, handler: Arc<dyn OperationHandler>) {
        tracing::debug!("Registered handler for {}", name);
        self.chains.entry(name).or_default().push(handler);
    }

    /// Mark an operation (by local name) as terminal in a pipelined batch
    pub fn mark_terminal(&mut self, name: impl Into<String>) {
        self.terminal.insert(name.into());
    }

    /// Whether the operation must be the last one in flight
    pub fn is_terminal(&self, name: &OperationName) -> bool {
        self.terminal.contains(&name.name)
    }

    /// Whether any handler is registered for the operation
    pub fn contains(&self, name: &OperationName) -> bool {
        self.lookup(name).is_some()
    }

    /// Registered operation names
    pub fn operations(&self) -> impl Iterator<Item = &OperationName> {
        self.chains.keys()
    }

    fn lookup(&self, name: &OperationName) -> Option<&Chain> {
        self.chains.get(name).or_else(|| {
            name.namespace
                .as_ref()
                .and_then(|_| self.chains.get(&OperationName::local(name.name.clone())))
        })
    }

    /// Run the chain registered for the request's operation.
    ///
    /// Handlers run in registration order, each receiving the previous
    /// output. The first error aborts the chain and is the result.
    pub async fn execute(&self, request: &OperationRequest) -> OperationResult {
        let chain = self
            .lookup(&request.operation)
            .filter(|chain| !chain.is_empty())
            .ok_or_else(|| RpcError::operation_not_supported(&request.operation.name))?;

        let mut previous = None;
        for (step, handler) in chain.iter().enumerate() {
            match handler.handle(request, previous.take()).await {
                Ok(output) => previous = Some(output),
                Err(err) => {
                    tracing::debug!(
                        "Operation {} (message-id {}) failed at step {}: {}",
                        request.operation,
                        request.message_id,
                        step,
                        err
                    );
                    return Err(err);
                },
            }
        }
        previous.ok_or_else(|| RpcError::operation_failed("operation produced no result").into())
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.chains.keys().collect::<Vec<_>>())
            .field("terminal", &self.terminal)
            .finish()
    }
}
