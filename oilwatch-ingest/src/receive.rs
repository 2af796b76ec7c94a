use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, Delivery, Receiver, Transport};
use crate::client::IngestClient;
use crate::storage::DeviceStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Reconnecting,
    Stopped,
}

impl<T: Transport, S: DeviceStorage> IngestClient<T, S> {
    /// Pulls deliveries until cancelled or closed, handing each one to its
    /// own task. Every delivery is accepted once dispatch has finished,
    /// whether or not dispatch succeeded.
    ///
    /// A receive failure outside shutdown triggers a reconnect; an error is
    /// returned only when reconnecting gives up. In-flight dispatch tasks are
    /// drained before this returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), BrokerError> {
        info!("receive loop started");

        let mut state = LoopState::Running;
        let result = loop {
            state = match state {
                LoopState::Running => self.receive_next(&cancel).await,
                LoopState::Reconnecting => match self.reconnect(&cancel).await {
                    Ok(next) => next,
                    Err(e) => break Err(e),
                },
                LoopState::Stopped => break Ok(()),
            };
        };

        self.tasks.close();
        debug!(in_flight = self.tasks.len(), "waiting for dispatch tasks");
        self.tasks.wait().await;

        info!("receive loop stopped");
        result
    }

    async fn receive_next(&self, cancel: &CancellationToken) -> LoopState {
        let Some(session) = self.slot.snapshot() else {
            return self.after_failure(cancel, "no live session");
        };

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return LoopState::Stopped,
            _ = self.stop.cancelled() => return LoopState::Stopped,
            received = session.receiver.receive() => received,
        };

        match received {
            Ok(delivery) => {
                self.spawn_dispatch(delivery);
                LoopState::Running
            }
            Err(e) => self.after_failure(cancel, &e.to_string()),
        }
    }

    fn after_failure(&self, cancel: &CancellationToken, reason: &str) -> LoopState {
        if self.is_stopping(cancel) {
            debug!(reason, "receive ended during shutdown");
            LoopState::Stopped
        } else {
            warn!(reason, "lost broker link, reconnecting");
            LoopState::Reconnecting
        }
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Result<LoopState, BrokerError> {
        let max_attempts = self.reconnect.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let delay = self.reconnect.backoff(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(LoopState::Stopped),
                    _ = self.stop.cancelled() => return Ok(LoopState::Stopped),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            attempt += 1;

            match self.connect(cancel).await {
                Ok(()) => {
                    info!(attempt, "reconnected to broker");
                    return Ok(LoopState::Running);
                }
                Err(_) if self.is_stopping(cancel) => return Ok(LoopState::Stopped),
                Err(e) if attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %e, "reconnect failed");
                }
                Err(e) => {
                    error!(attempt, error = %e, "giving up on reconnect");
                    return Err(e);
                }
            }
        }
    }

    fn spawn_dispatch(&self, delivery: Delivery) {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.tasks.spawn(async move {
            match dispatcher.dispatch(&delivery.message).await {
                Ok(outcome) => debug!(?outcome, "message dispatched"),
                Err(e) => warn!(error = %e, "failed to process message"),
            }
            if let Err(e) = delivery.accept().await {
                warn!(error = %e, "failed to acknowledge message");
            }
        });
    }
}
