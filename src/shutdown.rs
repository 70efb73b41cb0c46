//! Interrupt-driven shutdown for both clients.
//!
//! A service drains so requests already handed to it still get answered; a
//! load generator has nothing to finish and closes at once.

use crate::config::Role;
use crate::transport::{Transport, TransportError};
use std::future::Future;
use tracing::info;

#[derive(thiserror::Error, Debug)]
pub enum ShutdownError {
    #[error("can't wait for interrupt: {0}")]
    Signal(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownStrategy {
    /// Unsubscribe, let in-flight replies finish, then close.
    Drain,
    /// Close now; in-flight requests fail with `Closed`.
    Close,
}

impl ShutdownStrategy {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Replier => ShutdownStrategy::Drain,
            Role::Requestor => ShutdownStrategy::Close,
        }
    }

    pub async fn execute(self, transport: &dyn Transport) -> Result<(), TransportError> {
        match self {
            ShutdownStrategy::Drain => transport.drain().await,
            ShutdownStrategy::Close => {
                transport.close().await;
                Ok(())
            }
        }
    }
}

pub struct ShutdownCoordinator {
    strategy: ShutdownStrategy,
}

impl ShutdownCoordinator {
    pub fn for_role(role: Role) -> Self {
        Self {
            strategy: ShutdownStrategy::for_role(role),
        }
    }

    pub fn strategy(&self) -> ShutdownStrategy {
        self.strategy
    }

    /// Park until `signal` resolves, then tear the connection down.
    pub async fn run<F>(&self, signal: F, transport: &dyn Transport) -> Result<(), ShutdownError>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        signal.await?;
        info!(strategy = ?self.strategy, "Interrupt received, shutting down");
        self.strategy.execute(transport).await?;
        Ok(())
    }
}

/// Resolves on the first Ctrl+C / SIGINT.
pub async fn wait_for_interrupt() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
