//! NETCONF server.
//!
//! [`NetconfServer`] holds everything sessions share: the session registry,
//! the operation handlers and the timer service. Transports hand it
//! connected byte streams through [`NetconfServer::handle_connection`].
//!
//! # Example
//!
//! ```rust,ignore
//! use netconf::config::Config;
//! use netconf::dispatch::{handler_fn, OperationOutput, OperationResult};
//! use netconf::protocol::OperationName;
//! use netconf::server::NetconfServer;
//! use netconf::transport::{TcpTransport, Transport};
//!
//! let server = NetconfServer::builder(Config::default())
//!     .with_operation(
//!         OperationName::base("get"),
//!         handler_fn(|_req, _prev| async {
//!             OperationResult::Ok(OperationOutput::Data("<data/>".into()))
//!         }),
//!     )
//!     .build()?;
//! TcpTransport::localhost(2830).serve(server).await?;
//! ```

mod builtin;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatch::{OperationHandler, OperationRegistry};
use crate::error::{CloseReason, Result};
use crate::protocol::{CapabilitySet, OperationName};
use crate::registry::SessionRegistry;
use crate::session::{ServerContext, ServerSession};
use crate::timer::TimerService;

use builtin::KillSession;

/// A configured NETCONF server. Clones share state.
#[derive(Debug, Clone)]
pub struct NetconfServer {
    config: Arc<Config>,
    ctx: ServerContext,
}

impl NetconfServer {
    /// Start building a server from configuration
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// Server configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Session registry (monitoring, notifications, capability updates)
    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    /// Operation handlers
    pub fn operations(&self) -> &OperationRegistry {
        &self.ctx.operations
    }

    /// Run a session on an accepted connection until it closes.
    pub async fn handle_connection<T>(
        &self,
        io: T,
        peer: impl Into<String>,
        transport: &'static str,
    ) -> CloseReason
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let session_id = self.ctx.registry.allocate_id();
        let capabilities = self.ctx.registry.capabilities().await;
        ServerSession::new(
            io,
            peer,
            transport,
            session_id,
            capabilities,
            self.ctx.clone(),
        )
        .run()
        .await
    }

    /// Run a session on its own task.
    pub fn spawn_connection<T>(
        &self,
        io: T,
        peer: impl Into<String>,
        transport: &'static str,
    ) -> JoinHandle<CloseReason>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.clone();
        let peer = peer.into();
        tokio::spawn(async move { server.handle_connection(io, peer, transport).await })
    }

    /// Close every live session and refuse new registrations. Returns the
    /// number of sessions asked to close.
    pub async fn shutdown(&self) -> usize {
        self.ctx
            .registry
            .close_all(CloseReason::ServerShutdown)
            .await
    }
}

/// Builder for [`NetconfServer`]
pub struct ServerBuilder {
    config: Config,
    operations: OperationRegistry,
    capabilities: CapabilitySet,
}

impl ServerBuilder {
    fn new(config: Config) -> Self {
        let mut capabilities = CapabilitySet::base();
        for uri in &config.server.capabilities {
            capabilities.insert(uri.as_str());
        }
        Self {
            config,
            operations: OperationRegistry::new(),
            capabilities,
        }
    }

    /// Append a handler to the chain for `name`
    pub fn with_operation(
        mut self,
        name: OperationName,
        handler: impl OperationHandler + 'static,
    ) -> Self {
        self.operations.register(name, handler);
        self
    }

    /// Advertise an extra capability
    pub fn with_capability(mut self, uri: &str) -> Self {
        self.capabilities.insert(uri);
        self
    }

    /// Mark an operation terminal (by local name)
    pub fn with_terminal_operation(mut self, name: &str) -> Self {
        self.operations.mark_terminal(name);
        self
    }

    /// Validate configuration and assemble the server.
    ///
    /// Starts the timer service, so it must run inside a Tokio runtime.
    pub fn build(self) -> Result<NetconfServer> {
        let Self {
            config,
            mut operations,
            capabilities,
        } = self;
        config.validate()?;

        let registry = SessionRegistry::new(capabilities);
        let kill_session = OperationName::base("kill-session");
        if !operations.contains(&kill_session) {
            operations.register(kill_session, KillSession::new(registry.clone()));
        }
        for name in &config.server.terminal_operations {
            operations.mark_terminal(name.as_str());
        }
        tracing::debug!("Server operations: {:?}", operations);

        let ctx = ServerContext {
            registry,
            operations: Arc::new(operations),
            timers: TimerService::start(),
            config: config.session.clone(),
        };
        Ok(NetconfServer {
            config: Arc::new(config),
            ctx,
        })
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("capabilities", &self.capabilities)
            .field("operations", &self.operations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CANDIDATE_1_0;

    #[tokio::test]
    async fn test_build_registers_builtins() {
        let mut config = Config::default();
        config.server.capabilities.push(CANDIDATE_1_0.to_string());
        let server = NetconfServer::builder(config).build().unwrap();

        assert!(server
            .operations()
            .contains(&OperationName::base("kill-session")));
        assert!(server
            .operations()
            .is_terminal(&OperationName::base("commit")));

        let caps = server.registry().capabilities().await;
        assert!(caps.contains(CANDIDATE_1_0));
        assert!(caps.has_base());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = Config::default();
        config.session.max_message_size = 0;
        assert!(NetconfServer::builder(config).build().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_sessions() {
        let server = NetconfServer::builder(Config::default()).build().unwrap();
        assert_eq!(server.shutdown().await, 0);
        assert!(server.registry().is_closed().await);
    }
}
