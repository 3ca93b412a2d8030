//! Accept loop.
//!
//! Pulls connections off a [`Listener`] and hands each to the dispatcher as
//! a join. Accept errors are logged and retried after a short pause; the loop
//! only ends on shutdown or when the dispatcher is gone, and the listener is
//! closed when it does.

use crate::error::RelayError;
use crate::relay::dispatcher::DispatcherHandle;
use crate::relay::transport::Listener;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Acceptor<L> {
    listener: L,
    dispatcher: DispatcherHandle,
    backoff: Duration,
    shutdown: CancellationToken,
}

impl<L: Listener> Acceptor<L> {
    pub fn new(
        listener: L,
        dispatcher: DispatcherHandle,
        backoff: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            backoff,
            shutdown,
        }
    }

    /// Accept connections until shutdown.
    pub async fn run(mut self) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    if let Err(e) = self.dispatcher.join(stream, peer).await {
                        error!(error = %e, "Cannot hand off connection");
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %RelayError::Accept(e), "Failed to accept connection");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }

        info!("Acceptor stopped");
    }
}
