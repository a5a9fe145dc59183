//! Operations the server implements itself.

use crate::dispatch::{OperationFuture, OperationHandler, OperationOutput, OperationRequest};
use crate::error::CloseReason;
use crate::protocol::RpcError;
use crate::registry::SessionRegistry;

/// `<kill-session>`: force another session closed.
pub(crate) struct KillSession {
    registry: SessionRegistry,
}

impl KillSession {
    pub(crate) fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }
}

impl OperationHandler for KillSession {
    fn handle<'a>(
        &'a self,
        request: &'a OperationRequest,
        _previous: Option<OperationOutput>,
    ) -> OperationFuture<'a> {
        Box::pin(async move {
            let raw = request
                .parameter("session-id")?
                .ok_or_else(|| RpcError::missing_element("session-id"))?;
            let target: u64 = raw
                .parse()
                .map_err(|_| RpcError::invalid_value(format!("invalid session-id {raw:?}")))?;

            if target == request.session_id {
                return Err(RpcError::invalid_value("session cannot kill itself").into());
            }
            let reason = CloseReason::KillSession {
                killed_by: request.session_id,
            };
            if !self.registry.close_session(target, reason).await {
                return Err(RpcError::invalid_value(format!("no session {target}")).into());
            }
            tracing::info!("Session {} killed by session {}", target, request.session_id);
            Ok(OperationOutput::Ok)
        })
    }
}
